//! Wire-level tests: a raw TCP client speaking literal frames at a served
//! endpoint, asserting the exact reply bytes.

use epc::prelude::*;
use epc::runtime::run_local;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Frame a payload the way the codec does: `%06x` of byte length, then the
/// payload with a trailing newline.
fn frame(text: &str) -> Vec<u8> {
    let body = format!("{text}\n").into_bytes();
    let mut out = format!("{:06x}", body.len()).into_bytes();
    out.extend_from_slice(&body);
    out
}

async fn read_frame(stream: &mut TcpStream) -> String {
    let mut header = [0u8; 6];
    stream.read_exact(&mut header).await.unwrap();
    let len = usize::from_str_radix(std::str::from_utf8(&header).unwrap(), 16).unwrap();
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await.unwrap();
    let text = String::from_utf8(body).unwrap();
    assert!(text.ends_with('\n'), "payload must end in a newline");
    text.trim_end_matches('\n').to_owned()
}

async fn echo_server() -> EpcServer {
    EpcServer::start(0, |peer| {
        peer.define_method(
            Method::new("echo", |args| {
                Ok(MethodOutcome::Value(
                    args.into_iter().next().unwrap_or(Sexp::Nil),
                ))
            })
            .with_arg_specs("(X)")
            .with_docstring("echo X"),
        );
        peer.define_method(Method::new("boom", |_| Err("bad".to_owned())));
    })
    .await
    .unwrap()
}

#[test]
fn echo_reply_is_byte_exact() {
    run_local(async {
        let server = echo_server().await;
        let mut raw = TcpStream::connect(("127.0.0.1", server.port())).await.unwrap();

        raw.write_all(&frame("(call 7 echo (\"hi\"))")).await.unwrap();
        assert_eq!(read_frame(&mut raw).await, "(return 7 \"hi\")");

        server.stop();
    })
    .unwrap();
}

#[test]
fn unknown_method_reply_is_byte_exact() {
    run_local(async {
        let server = echo_server().await;
        let mut raw = TcpStream::connect(("127.0.0.1", server.port())).await.unwrap();

        raw.write_all(&frame("(call 8 nonesuch nil)")).await.unwrap();
        assert_eq!(
            read_frame(&mut raw).await,
            "(epc-error 8 \"EPC-ERROR: No such method : nonesuch\")"
        );

        server.stop();
    })
    .unwrap();
}

#[test]
fn task_failure_reply_is_byte_exact() {
    run_local(async {
        let server = echo_server().await;
        let mut raw = TcpStream::connect(("127.0.0.1", server.port())).await.unwrap();

        raw.write_all(&frame("(call 9 boom (1 2))")).await.unwrap();
        assert_eq!(
            read_frame(&mut raw).await,
            "(return-error 9 \"FAILED in boom: (1 2) with ERROR: \\\"bad\\\"\")"
        );

        server.stop();
    })
    .unwrap();
}

#[test]
fn methods_introspection_reply_is_byte_exact() {
    run_local(async {
        let server = EpcServer::start(0, |peer| {
            peer.define_method(
                Method::new("echo", |args| {
                    Ok(MethodOutcome::Value(
                        args.into_iter().next().unwrap_or(Sexp::Nil),
                    ))
                })
                .with_arg_specs("(X)")
                .with_docstring("echo X"),
            );
        })
        .await
        .unwrap();
        let mut raw = TcpStream::connect(("127.0.0.1", server.port())).await.unwrap();

        raw.write_all(&frame("(methods 7)")).await.unwrap();
        assert_eq!(
            read_frame(&mut raw).await,
            "(return 7 ((echo \"(X)\" \"echo X\")))"
        );

        server.stop();
    })
    .unwrap();
}

#[test]
fn frames_split_across_writes_still_decode() {
    run_local(async {
        let server = echo_server().await;
        let mut raw = TcpStream::connect(("127.0.0.1", server.port())).await.unwrap();

        let bytes = frame("(call 11 echo (\"split\"))");
        let (a, b) = bytes.split_at(9);
        raw.write_all(a).await.unwrap();
        raw.flush().await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        raw.write_all(b).await.unwrap();

        assert_eq!(read_frame(&mut raw).await, "(return 11 \"split\")");

        server.stop();
    })
    .unwrap();
}

#[test]
fn pipelined_frames_are_answered_in_order() {
    run_local(async {
        let server = echo_server().await;
        let mut raw = TcpStream::connect(("127.0.0.1", server.port())).await.unwrap();

        let mut bytes = frame("(call 21 echo (\"a\"))");
        bytes.extend_from_slice(&frame("(call 22 echo (\"b\"))"));
        raw.write_all(&bytes).await.unwrap();

        assert_eq!(read_frame(&mut raw).await, "(return 21 \"a\")");
        assert_eq!(read_frame(&mut raw).await, "(return 22 \"b\")");

        server.stop();
    })
    .unwrap();
}

#[test]
fn malformed_payload_does_not_stall_the_stream() {
    run_local(async {
        let server = echo_server().await;
        let mut raw = TcpStream::connect(("127.0.0.1", server.port())).await.unwrap();

        // A complete frame whose payload is unreadable, then a valid call.
        raw.write_all(&frame(")((")).await.unwrap();
        raw.write_all(&frame("(call 31 echo (\"still-here\"))"))
            .await
            .unwrap();

        assert_eq!(read_frame(&mut raw).await, "(return 31 \"still-here\")");

        server.stop();
    })
    .unwrap();
}

#[test]
fn non_ascii_strings_survive_the_wire() {
    run_local(async {
        let server = echo_server().await;
        let client = EpcManager::connect(&format!("127.0.0.1:{}", server.port()))
            .await
            .unwrap();

        let text = "こんにちは — ñandú";
        let reply = client
            .call_sync("echo", vec![Sexp::string(text)])
            .await
            .unwrap();
        assert_eq!(reply, Sexp::string(text));

        client.stop();
        server.stop();
    })
    .unwrap();
}
