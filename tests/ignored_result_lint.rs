//! AST-level test to detect ignored results of sends and device channel writes.
//!
//! Discarding these results hides exactly the failures this service must react to:
//! - A oneshot send fails when the requester (a Cast command, a stream) gave up
//! - An mpsc send fails when the HTTP client hung up mid-stream
//! - A frame or telnet write fails when the device channel is already dead
//!
//! Flagged:
//! ```ignore
//! let _ = tx.send(chunk).await;
//! let _ = write_frame(&mut writer, &message).await;
//! ```
//!
//! Accepted:
//! ```ignore
//! if tx.send(chunk).await.is_err() {
//!     return Err(StreamError::Cancelled);
//! }
//! write_frame(&mut writer, &message).await?;
//! ```

use std::fs;
use std::path::Path;
use syn::visit::Visit;
use syn::{Expr, File, Pat, Stmt};
use walkdir::WalkDir;

/// Method names whose results must not be discarded
const CHECKED_METHODS: &[&str] = &["send", "write_all", "flush", "write_line"];

/// Free functions whose results must not be discarded
const CHECKED_FNS: &[&str] = &["write_frame"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DiscardForm {
    /// `let _ = op(..);`
    WildcardLet,
    /// `op(..);`
    BareStatement,
}

#[derive(Debug)]
struct Discard {
    file: String,
    op: String,
    form: DiscardForm,
}

/// Name of the checked operation `expr` performs, looking through `.await`
fn checked_op(expr: &Expr) -> Option<String> {
    let expr = match expr {
        Expr::Await(awaited) => &*awaited.base,
        other => other,
    };
    let name = match expr {
        Expr::MethodCall(call) => call.method.to_string(),
        Expr::Call(call) => match &*call.func {
            Expr::Path(path) => path.path.segments.last()?.ident.to_string(),
            _ => return None,
        },
        _ => return None,
    };
    let checked = match expr {
        Expr::MethodCall(_) => CHECKED_METHODS.contains(&name.as_str()),
        _ => CHECKED_FNS.contains(&name.as_str()),
    };
    checked.then_some(name)
}

struct DiscardFinder {
    file: String,
    found: Vec<Discard>,
}

impl<'ast> Visit<'ast> for DiscardFinder {
    fn visit_stmt(&mut self, stmt: &'ast Stmt) {
        let discarded = match stmt {
            Stmt::Local(local) if matches!(local.pat, Pat::Wild(_)) => local
                .init
                .as_ref()
                .and_then(|init| checked_op(&init.expr))
                .map(|op| (op, DiscardForm::WildcardLet)),
            Stmt::Expr(expr, Some(_)) => checked_op(expr).map(|op| (op, DiscardForm::BareStatement)),
            _ => None,
        };
        if let Some((op, form)) = discarded {
            self.found.push(Discard {
                file: self.file.clone(),
                op,
                form,
            });
        }
        syn::visit::visit_stmt(self, stmt);
    }
}

fn analyze_source(file: &str, syntax: &File) -> Vec<Discard> {
    let mut finder = DiscardFinder {
        file: file.to_string(),
        found: Vec::new(),
    };
    finder.visit_file(syntax);
    finder.found
}

fn analyze_file(path: &Path) -> Vec<Discard> {
    let Ok(content) = fs::read_to_string(path) else {
        return vec![];
    };
    match syn::parse_file(&content) {
        Ok(syntax) => analyze_source(&path.display().to_string(), &syntax),
        Err(e) => {
            eprintln!("Warning: Failed to parse {}: {}", path.display(), e);
            vec![]
        }
    }
}

fn discards_in(code: &str) -> Vec<Discard> {
    analyze_source("test.rs", &syn::parse_file(code).unwrap())
}

#[test]
fn flags_dropped_chunk_and_reply_sends() {
    let found = discards_in(
        r#"
        async fn produce(tx: mpsc::Sender<Bytes>, done: oneshot::Sender<()>) {
            let _ = tx.send(Bytes::new()).await;
            done.send(());
        }
    "#,
    );
    let forms: Vec<_> = found.iter().map(|d| d.form).collect();
    assert_eq!(forms, [DiscardForm::WildcardLet, DiscardForm::BareStatement]);
    assert!(found.iter().all(|d| d.op == "send"));
}

#[test]
fn flags_dropped_device_writes() {
    let found = discards_in(
        r#"
        async fn close(writer: &mut Writer, message: CastMessage) {
            let _ = write_frame(writer, &message).await;
            let _ = cast_proto::write_frame(writer, &message).await;
            let _ = writer.write_all(b"stop\n").await;
        }
    "#,
    );
    let ops: Vec<_> = found.iter().map(|d| d.op.as_str()).collect();
    assert_eq!(ops, ["write_frame", "write_frame", "write_all"]);
}

#[test]
fn handled_or_returned_results_pass() {
    let found = discards_in(
        r#"
        async fn produce(tx: mpsc::Sender<Bytes>, writer: &mut Writer, message: CastMessage) -> Result<(), Error> {
            if tx.send(Bytes::new()).await.is_err() {
                return Err(Error::Cancelled);
            }
            write_frame(writer, &message).await?;
            writer.flush().await?;
            match self.sender.send(event) {
                Ok(n) => n,
                Err(_) => 0,
            };
            tx.send(Bytes::new()).await
        }
    "#,
    );
    assert!(found.is_empty(), "{:?}", found);
}

#[test]
fn no_discarded_send_or_write_results() {
    let src_dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("src");

    let found: Vec<Discard> = WalkDir::new(&src_dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "rs"))
        .flat_map(|e| analyze_file(e.path()))
        .collect();

    if !found.is_empty() {
        let mut msg = String::from(
            "\n\nFound discarded send/write results.\n\
             A failed send means the other side is gone; a failed write means the\n\
             device channel is dead. Handle it or propagate it:\n\
             ```rust\n\
             if tx.send(chunk).await.is_err() { return Err(StreamError::Cancelled); }\n\
             write_frame(&mut writer, &message).await?;\n\
             ```\n\n\
             Violations:\n",
        );
        for d in &found {
            msg.push_str(&format!("  - {}: {} ({:?})\n", d.file, d.op, d.form));
        }
        panic!("{}", msg);
    }
}
