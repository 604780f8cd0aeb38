//! End-to-end: a script hits `set_trace()`, a remote client connects, picks
//! the thread in the chooser, edits a variable, continues, and leaves
//! through the chooser's Exit.

mod common;

use remdbg_engine::interp::Interp;
use remdbg_engine::value::Value;
use remdbg_engine::{parser, registry};
use tokio::io::AsyncWriteExt;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn set_trace_meets_client() {
    let addr = common::free_addr();
    remdbg_server::listen(addr).expect("listen");

    let script = std::thread::Builder::new()
        .name("script-main".to_string())
        .spawn(|| {
            let _guard = registry::register_current_thread("script-main");
            let src = "original_value = 0\nvalue_to_change = 0\nset_trace()\nchanged = original_value != value_to_change\n";
            let program = parser::parse(src).expect("parse");
            let mut interp = Interp::new("scenario.rsc");
            interp.run(&program).expect("run");
            interp
        })
        .expect("spawn script thread");

    // Let the script reach the shell so the session exists and the prompt
    // is sitting in scrollback.
    tokio::time::sleep(std::time::Duration::from_millis(300)).await;

    let mut stream = common::connect_and_configure(addr).await;
    let mut seen = Vec::new();

    // Chooser shows the registered thread; Enter attaches to it.
    common::read_until(&mut stream, "script-main", &mut seen).await;
    stream.write_all(b"\r").await.unwrap();

    // The shell prompt arrives via scrollback replay.
    common::read_until(&mut stream, "(rdb) ", &mut seen).await;
    stream.write_all(b"value_to_change += 1\nc\n").await.unwrap();
    common::read_until(&mut stream, "Resuming program", &mut seen).await;

    let interp = script.join().expect("script thread");
    assert_eq!(
        interp.globals_ref().borrow().get("changed"),
        Some(&Value::Bool(true))
    );

    // Debugger done: the same socket is sent back to the chooser.
    common::read_until_count(&mut stream, "Choose thread to debug", 2, &mut seen).await;

    // Exit from the chooser; the server says goodbye and closes.
    stream.write_all(b"q").await.unwrap();
    common::read_until(&mut stream, "Closing connection", &mut seen).await;
    common::read_to_eof(&mut stream, &mut seen).await;
}
