//! End-to-end scenarios: two managers talking over real loopback TCP.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use epc::prelude::*;
use epc::runtime::run_local;

async fn serve<F: Fn(&EpcManager) + 'static>(connect_fn: F) -> (EpcServer, EpcManager) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
    let server = EpcServer::start(0, connect_fn).await.unwrap();
    let client = EpcManager::connect(&format!("127.0.0.1:{}", server.port()))
        .await
        .unwrap();
    (server, client)
}

#[test]
fn echo_roundtrip() {
    run_local(async {
        let (server, client) = serve(|peer| {
            peer.define_method(Method::new("echo", |args| {
                Ok(MethodOutcome::Value(
                    args.into_iter().next().unwrap_or(Sexp::Nil),
                ))
            }));
        })
        .await;

        let reply = client.call_sync("echo", vec![Sexp::string("hi")]).await;
        assert_eq!(reply, Ok(Sexp::string("hi")));

        client.stop();
        server.stop();
    })
    .unwrap();
}

#[test]
fn unknown_method_is_a_tagged_protocol_error() {
    run_local(async {
        let (server, client) = serve(|_| {}).await;

        let err = client.call_sync("nonesuch", vec![]).await.unwrap_err();
        assert!(err.is_protocol());
        assert_eq!(
            err,
            EpcError::Protocol("EPC-ERROR: No such method : nonesuch".into())
        );

        client.stop();
        server.stop();
    })
    .unwrap();
}

#[test]
fn task_error_carries_method_and_rendering() {
    run_local(async {
        let (server, client) = serve(|peer| {
            peer.define_method(Method::new("boom", |_| Err("bad".to_owned())));
        })
        .await;

        let err = client
            .call_sync("boom", vec![Sexp::Int(1), Sexp::Int(2)])
            .await
            .unwrap_err();
        let rendered = err.to_string();
        assert!(rendered.contains("boom"));
        assert!(rendered.contains("\"bad\""));
        assert_eq!(
            err,
            EpcError::Application("FAILED in boom: (1 2) with ERROR: \"bad\"".into())
        );

        client.stop();
        server.stop();
    })
    .unwrap();
}

#[test]
fn async_task_replies_only_after_its_deferred_resolves() {
    run_local(async {
        let gates: Rc<RefCell<Vec<Deferred>>> = Rc::new(RefCell::new(Vec::new()));
        let (server, client) = serve({
            let gates = gates.clone();
            move |peer| {
                let gates = gates.clone();
                peer.define_method(Method::new("later", move |_| {
                    let gate = Deferred::new();
                    gates.borrow_mut().push(gate.clone());
                    Ok(MethodOutcome::Deferred(gate))
                }));
            }
        })
        .await;

        let pending = client.call("later", vec![]);

        // The server has dispatched but not replied.
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(pending.settled(), None);
        assert_eq!(client.session_count(), 1);

        let gate = gates.borrow_mut().pop().unwrap();
        gate.post_resolve(Sexp::Int(42));
        assert_eq!(pending.wait().await, Ok(Sexp::Int(42)));
        assert_eq!(client.session_count(), 0);

        client.stop();
        server.stop();
    })
    .unwrap();
}

#[test]
fn sync_wait_returns_once_the_reply_arrives() {
    run_local(async {
        let (server, client) = serve(|peer| {
            peer.define_method(Method::new("slow", |_| {
                let gate = Deferred::new();
                let handle = gate.clone();
                epc::runtime::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(40)).await;
                    handle.post_resolve(Sexp::symbol("done"));
                });
                Ok(MethodOutcome::Deferred(gate))
            }));
        })
        .await;

        let started = std::time::Instant::now();
        let reply = client.call_sync("slow", vec![]).await;
        assert_eq!(reply, Ok(Sexp::symbol("done")));
        assert!(started.elapsed() >= Duration::from_millis(40));

        client.stop();
        server.stop();
    })
    .unwrap();
}

#[test]
fn both_sides_can_call_each_other() {
    run_local(async {
        let served: Rc<RefCell<Vec<EpcManager>>> = Rc::new(RefCell::new(Vec::new()));
        let (server, client) = serve({
            let served = served.clone();
            move |peer| {
                peer.define_method(Method::new("double", |args| {
                    let n = args.first().and_then(Sexp::as_int).unwrap_or(0);
                    Ok(MethodOutcome::Value(Sexp::Int(n * 2)))
                }));
                served.borrow_mut().push(peer.clone());
            }
        })
        .await;
        client.define_method(Method::new("halve", |args| {
            let n = args.first().and_then(Sexp::as_int).unwrap_or(0);
            Ok(MethodOutcome::Value(Sexp::Int(n / 2)))
        }));

        assert_eq!(
            client.call_sync("double", vec![Sexp::Int(21)]).await,
            Ok(Sexp::Int(42))
        );

        // Now the server calls back into the client over the same socket.
        let peer = served.borrow().first().cloned().unwrap();
        assert_eq!(
            peer.call_sync("halve", vec![Sexp::Int(42)]).await,
            Ok(Sexp::Int(21))
        );

        client.stop();
        server.stop();
    })
    .unwrap();
}

#[test]
fn sequential_calls_dispatch_in_order() {
    run_local(async {
        let seen: Rc<RefCell<Vec<i64>>> = Rc::new(RefCell::new(Vec::new()));
        let (server, client) = serve({
            let seen = seen.clone();
            move |peer| {
                let seen = seen.clone();
                peer.define_method(Method::new("note", move |args| {
                    seen.borrow_mut()
                        .push(args.first().and_then(Sexp::as_int).unwrap_or(-1));
                    Ok(MethodOutcome::Value(Sexp::Nil))
                }));
            }
        })
        .await;

        for i in 0..5 {
            client.call_sync("note", vec![Sexp::Int(i)]).await.unwrap();
        }
        assert_eq!(*seen.borrow(), vec![0, 1, 2, 3, 4]);

        client.stop();
        server.stop();
    })
    .unwrap();
}

#[cfg(unix)]
#[test]
fn start_process_connects_via_announced_port() {
    run_local(async {
        let server = EpcServer::start(0, |peer| {
            peer.define_method(Method::new("ping", |_| {
                Ok(MethodOutcome::Value(Sexp::symbol("pong")))
            }));
        })
        .await
        .unwrap();

        // Stand-in child: announces the port on stdout and lingers the way a
        // real served process would.
        let client = EpcManager::start_process(
            "sh",
            &["-c", &format!("echo {}; sleep 5", server.port())],
        )
        .await
        .unwrap();
        assert_eq!(
            client.call_sync("ping", vec![]).await,
            Ok(Sexp::symbol("pong"))
        );

        client.stop();
        server.stop();
    })
    .unwrap();
}

#[cfg(unix)]
#[test]
fn start_process_rejects_bad_port_announcement() {
    run_local(async {
        let err = EpcManager::start_process("sh", &["-c", "echo not-a-port"])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    })
    .unwrap();
}

#[test]
fn stopping_twice_changes_nothing() {
    run_local(async {
        let (server, client) = serve(|_| {}).await;
        client.stop();
        let live_after_first = client.is_live();
        client.stop();
        assert_eq!(client.is_live(), live_after_first);
        assert!(!client.is_live());
        server.stop();
        server.stop();
        assert_eq!(server.client_count(), 0);
    })
    .unwrap();
}
