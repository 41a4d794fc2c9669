use sirocco::Application;
use sirocco::HttpClient;
use sirocco::HttpServer;
use sirocco::NetThread;
use sirocco::Timer;
use sirocco::ws::close_code;
use std::cell::Cell;
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::mpsc;

fn failsafe(ctx: &sirocco::Context) {
    ctx.start_timer(Timer::new(10_000, false, |ctx| ctx.stop()));
}

fn spawn_ws_echo_server() -> (NetThread, std::net::SocketAddr) {
    let (addr_tx, addr_rx) = mpsc::channel();

    let server = NetThread::spawn("ws-server", move |ctx| {
        let server = HttpServer::open(ctx, "127.0.0.1:0".parse().unwrap())?;
        server.set_request_handler("/", |ctx, channel| {
            if !channel.is_ws_handshake_request() {
                channel.send_status(400, "", "expected websocket upgrade");
                channel.close();
                return;
            }
            channel.send_ws_handshake_response("");
            let ws = match channel.upgrade_to_web_socket(ctx) {
                Ok(ws) => ws,
                Err(_) => return,
            };
            // Echo every data frame back, unmasked (server side).
            ws.set_data_frame_handler(|_ctx, ws, frame| {
                ws.send(&frame.payload);
            });
            ws.set_control_frame_handler(|ctx, ws, frame| {
                ws.on_control_frame(ctx, frame);
            });
        });
        addr_tx.send(server.local_endpoint()).unwrap();
        Ok(())
    })
    .unwrap();

    let addr = addr_rx.recv().unwrap();
    (server, addr)
}

#[test]
fn binary_payload_echoes_unchanged() {
    let (server, addr) = spawn_ws_echo_server();

    let mut app = Application::new("ws-client").unwrap();
    let ctx = app.context().clone();
    failsafe(&ctx);

    let payload: Vec<u8> = (0..1000_u32).map(|i| (i * 31 % 251) as u8).collect();
    let echoed = Rc::new(RefCell::new(Vec::new()));

    let client = HttpClient::new();
    let payload2 = payload.clone();
    let echoed2 = echoed.clone();
    client
        .request_ws_handshake(&ctx, &format!("ws://{addr}/"), "", move |ctx, client, code| {
            assert_eq!(code, 0);
            assert_eq!(client.status_code(), 101);
            assert!(client.verify_ws_handshake_response());

            let ws = client.upgrade_to_web_socket(ctx).unwrap();
            let echoed = echoed2.clone();
            let expected_len = payload2.len();
            ws.set_data_frame_handler(move |ctx, _ws, frame| {
                echoed.borrow_mut().extend_from_slice(&frame.payload);
                if echoed.borrow().len() >= expected_len {
                    ctx.stop();
                }
            });
            assert_eq!(ws.send(&payload2), 0);
        })
        .unwrap();

    app.run();
    assert_eq!(&*echoed.borrow(), &payload);

    server.stop();
    server.join();
}

#[test]
fn handshake_is_refused_for_plain_requests() {
    let (server, addr) = spawn_ws_echo_server();

    let (code, response) = HttpClient::request_sync(
        "GET",
        &format!("http://{addr}/"),
        Vec::new(),
        sirocco::RequestOption::default(),
    )
    .unwrap();
    assert_eq!(code, 0);
    assert_eq!(response.status_code, 400);

    server.stop();
    server.join();
}

#[test]
fn ping_gets_ponged_and_close_handshake_completes() {
    let (server, addr) = spawn_ws_echo_server();

    let mut app = Application::new("ws-control").unwrap();
    let ctx = app.context().clone();
    failsafe(&ctx);

    let got_pong = Rc::new(Cell::new(false));
    let ws_closed = Rc::new(Cell::new(false));

    let client = HttpClient::new();
    let got_pong2 = got_pong.clone();
    let ws_closed2 = ws_closed.clone();
    client
        .request_ws_handshake(&ctx, &format!("ws://{addr}/"), "", move |ctx, client, code| {
            assert_eq!(code, 0);
            assert!(client.verify_ws_handshake_response());

            let ws = client.upgrade_to_web_socket(ctx).unwrap();

            let got_pong = got_pong2.clone();
            ws.set_control_frame_handler(move |ctx, ws, frame| {
                if frame.opcode == sirocco::ws::opcode::PONG {
                    assert_eq!(frame.payload, b"probe");
                    got_pong.set(true);
                    // Pong received; run the close handshake.
                    ws.close(ctx, close_code::NORMAL_CLOSURE);
                }
                ws.on_control_frame(ctx, frame);
            });

            let ws_closed = ws_closed2.clone();
            ws.set_close_handler(move |ctx, _ws| {
                ws_closed.set(true);
                ctx.stop();
            });

            assert_eq!(ws.send_ping(b"probe"), 0);
        })
        .unwrap();

    app.run();
    assert!(got_pong.get());
    assert!(ws_closed.get());

    server.stop();
    server.join();
}
