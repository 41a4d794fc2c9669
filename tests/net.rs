use sirocco::Application;
use sirocco::NetThread;
use sirocco::TcpClient;
use sirocco::TcpServer;
use sirocco::Timer;
use sirocco::UdpReceiver;
use sirocco::UdpSender;
use std::cell::Cell;
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::mpsc;
use std::time::Duration;
use std::time::Instant;

/// Aborts a stuck test run instead of hanging forever.
fn failsafe(ctx: &sirocco::Context) {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    ctx.start_timer(Timer::new(10_000, false, |ctx| ctx.stop()));
}

#[test]
fn echo_server_round_trip() {
    let (addr_tx, addr_rx) = mpsc::channel();

    let server = NetThread::spawn("echo-server", move |ctx| {
        let server = TcpServer::open(ctx, "127.0.0.1:0".parse().unwrap(), |ctx, _server, chan| {
            if TcpServer::accept(ctx, &chan).is_err() {
                return;
            }
            chan.set_receive_handler(|_ctx, chan| {
                let data = chan.receive_all(256);
                if !data.is_empty() {
                    chan.send(&data);
                }
            });
        })?;
        addr_tx.send(server.local_endpoint()).unwrap();
        Ok(())
    })
    .unwrap();
    let addr = addr_rx.recv().unwrap();

    let mut app = Application::new("echo-client").unwrap();
    let ctx = app.context().clone();
    failsafe(&ctx);

    let received = Rc::new(RefCell::new(Vec::new()));
    let closed = Rc::new(Cell::new(false));

    let client = TcpClient::new();
    let received2 = received.clone();
    let closed2 = closed.clone();
    client
        .connect_endpoints(
            &ctx,
            vec![addr],
            move |_ctx, client, code| {
                assert_eq!(code, 0);
                let received = received2.clone();
                let closed = closed2.clone();
                client.set_receive_handler(move |ctx, chan| {
                    // The close callback must not have come first.
                    assert!(!closed.get());
                    let data = chan.receive_all(16);
                    received.borrow_mut().extend_from_slice(&data);
                    if received.borrow().len() >= 6 {
                        ctx.stop();
                    }
                });
                let closed = closed2.clone();
                client.set_close_handler(move |_ctx, _chan| closed.set(true));
                assert_eq!(client.send(b"hello\0"), 0);
            },
            2_000,
        )
        .unwrap();

    app.run();
    assert_eq!(&*received.borrow(), b"hello\0");

    server.stop();
    server.join();
}

#[test]
fn connect_timeout_on_blackholed_address() {
    let mut app = Application::new("timeout-client").unwrap();
    let ctx = app.context().clone();
    failsafe(&ctx);

    let result = Rc::new(Cell::new(None));
    let started = Instant::now();

    let client = TcpClient::new();
    let result2 = result.clone();
    client
        .connect(
            &ctx,
            "10.255.255.1:9",
            move |ctx, _client, code| {
                result2.set(Some(code));
                ctx.stop();
            },
            200,
        )
        .unwrap();

    app.run();

    let code = result.get().expect("connect handler never fired");
    assert_ne!(code, 0);
    // 200ms timeout plus scheduling slack; never the 10s failsafe.
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[test]
fn graceful_close_delivers_all_bytes_before_close() {
    let (addr_tx, addr_rx) = mpsc::channel();
    let (result_tx, result_rx) = mpsc::channel();

    let server = NetThread::spawn("sink-server", move |ctx| {
        let result_tx = result_tx.clone();
        let server = TcpServer::open(ctx, "127.0.0.1:0".parse().unwrap(), move |ctx, _server, chan| {
            if TcpServer::accept(ctx, &chan).is_err() {
                return;
            }
            let buffer = Rc::new(RefCell::new(Vec::new()));
            let closes = Rc::new(Cell::new(0_u32));

            let buffer2 = buffer.clone();
            chan.set_receive_handler(move |_ctx, chan| {
                let data = chan.receive_all(4096);
                buffer2.borrow_mut().extend_from_slice(&data);
            });

            let result_tx = result_tx.clone();
            let closes2 = closes.clone();
            chan.set_close_handler(move |_ctx, _chan| {
                closes2.set(closes2.get() + 1);
                result_tx
                    .send((buffer.borrow().len(), closes2.get()))
                    .unwrap();
            });
        })?;
        addr_tx.send(server.local_endpoint()).unwrap();
        Ok(())
    })
    .unwrap();
    let addr = addr_rx.recv().unwrap();

    let mut app = Application::new("burst-client").unwrap();
    let ctx = app.context().clone();
    failsafe(&ctx);

    let payload = vec![0x5A_u8; 4096];
    let client = TcpClient::new();
    client
        .connect_endpoints(
            &ctx,
            vec![addr],
            move |_ctx, client, code| {
                assert_eq!(code, 0);
                client.set_close_handler(move |ctx, _chan| ctx.stop());
                assert_eq!(client.send(&payload), 0);
                // Close immediately: queued bytes must still drain first.
                client.close();
            },
            2_000,
        )
        .unwrap();

    app.run();

    let (bytes, closes) = result_rx
        .recv_timeout(Duration::from_secs(10))
        .expect("server never observed the close");
    assert_eq!(bytes, 4096);
    assert_eq!(closes, 1);

    server.stop();
    server.join();
}

#[test]
fn cancelled_timer_never_fires_again() {
    let mut app = Application::new("timer-load").unwrap();
    let ctx = app.context().clone();
    failsafe(&ctx);

    let fired = Rc::new(Cell::new(0_u32));
    let frozen = Rc::new(Cell::new(0_u32));
    let timer_id = Rc::new(Cell::new(0));

    let fired2 = fired.clone();
    let id = ctx.start_timer(Timer::new(10, true, move |ctx| {
        fired2.set(fired2.get() + 1);
        // Keep the loop busy with self-posted work.
        for _ in 0..200 {
            ctx.post_task(|_| {});
        }
    }));
    timer_id.set(id);

    let fired3 = fired.clone();
    let frozen2 = frozen.clone();
    let timer_id2 = timer_id.clone();
    ctx.start_timer(Timer::new(50, false, move |ctx| {
        ctx.cancel_timer(timer_id2.get());
        frozen2.set(fired3.get());
        // Leave the loop running; any late fire would be caught below.
        ctx.start_timer(Timer::new(100, false, |ctx| ctx.stop()));
    }));

    app.run();

    assert!(fired.get() > 0);
    assert_eq!(fired.get(), frozen.get());
    assert!(!ctx.timer_running(timer_id.get()));
}

#[test]
fn udp_receiver_sees_datagrams() {
    let (addr_tx, addr_rx) = mpsc::channel();
    let (data_tx, data_rx) = mpsc::channel();

    let receiver = NetThread::spawn("udp-receiver", move |ctx| {
        let data_tx = data_tx.clone();
        let receiver = UdpReceiver::open(ctx, "127.0.0.1:0".parse().unwrap(), move |_ctx, receiver| {
            let (data, sender) = receiver.receive_all(256);
            if !data.is_empty() {
                data_tx.send((data, sender)).unwrap();
            }
        })?;
        addr_tx.send(receiver.local_endpoint()).unwrap();
        Ok(())
    })
    .unwrap();
    let addr = addr_rx.recv().unwrap();

    let sender = UdpSender::create(addr).unwrap();
    assert_eq!(sender.send(b"ping"), 4);

    let (data, from) = data_rx
        .recv_timeout(Duration::from_secs(10))
        .expect("datagram never arrived");
    assert_eq!(data, b"ping");
    assert!(from.is_some());

    receiver.stop();
    receiver.join();
}

#[test]
fn send_completion_handlers_fire_in_order() {
    let (addr_tx, addr_rx) = mpsc::channel();

    let server = NetThread::spawn("order-server", move |ctx| {
        let server = TcpServer::open(ctx, "127.0.0.1:0".parse().unwrap(), |ctx, _server, chan| {
            let _ = TcpServer::accept(ctx, &chan);
        })?;
        addr_tx.send(server.local_endpoint()).unwrap();
        Ok(())
    })
    .unwrap();
    let addr = addr_rx.recv().unwrap();

    let mut app = Application::new("order-client").unwrap();
    let ctx = app.context().clone();
    failsafe(&ctx);

    let order = Rc::new(RefCell::new(Vec::new()));
    let client = TcpClient::new();
    let order2 = order.clone();
    client
        .connect_endpoints(
            &ctx,
            vec![addr],
            move |_ctx, client, code| {
                assert_eq!(code, 0);
                for tag in 0..5_u32 {
                    let order = order2.clone();
                    client.send_with(&[tag as u8; 128], move |ctx, _chan, code| {
                        assert_eq!(code, 0);
                        order.borrow_mut().push(tag);
                        if tag == 4 {
                            ctx.stop();
                        }
                    });
                }
            },
            2_000,
        )
        .unwrap();

    app.run();
    assert_eq!(&*order.borrow(), &[0, 1, 2, 3, 4]);

    server.stop();
    server.join();
}
