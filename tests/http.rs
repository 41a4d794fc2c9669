use sirocco::error;
use sirocco::HttpClient;
use sirocco::HttpServer;
use sirocco::HttpServerApp;
use sirocco::NetThread;
use sirocco::RequestOption;
use sirocco::ServerOption;
use sirocco::TcpServer;
use std::sync::mpsc;
use std::time::Duration;

#[test]
fn chunked_response_decodes_to_full_body() {
    let (addr_tx, addr_rx) = mpsc::channel();

    // A raw TCP server speaking just enough HTTP to answer with a
    // chunked body.
    let server = NetThread::spawn("chunked-server", move |ctx| {
        let server = TcpServer::open(ctx, "127.0.0.1:0".parse().unwrap(), |ctx, _server, chan| {
            if TcpServer::accept(ctx, &chan).is_err() {
                return;
            }
            chan.set_receive_handler(|_ctx, chan| {
                let data = chan.receive_all(1024);
                // Respond once the request head is complete.
                if data.windows(4).any(|w| w == b"\r\n\r\n") {
                    chan.send(
                        b"HTTP/1.1 200 OK\r\n\
                          Transfer-Encoding: chunked\r\n\
                          \r\n\
                          5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n",
                    );
                    chan.close();
                }
            });
        })?;
        addr_tx.send(server.local_endpoint()).unwrap();
        Ok(())
    })
    .unwrap();
    let addr = addr_rx.recv().unwrap();

    let (code, response) = HttpClient::request_sync(
        "GET",
        &format!("http://{addr}/"),
        Vec::new(),
        RequestOption::default(),
    )
    .unwrap();

    assert_eq!(code, 0);
    assert_eq!(response.status_code, 200);
    assert_eq!(response.body, b"hello world");

    server.stop();
    server.join();
}

#[test]
fn post_body_with_content_length_round_trips() {
    let (addr_tx, addr_rx) = mpsc::channel();

    let server = NetThread::spawn("echo-http", move |ctx| {
        let server = HttpServer::open(ctx, "127.0.0.1:0".parse().unwrap())?;
        server.set_request_handler("/echo", |_ctx, channel| {
            let body = channel.take_request().body;
            let mut response = sirocco::HttpResponse::new(200);
            response.set_body(body);
            channel.send_response(&mut response);
            channel.close();
        });
        addr_tx.send(server.local_endpoint()).unwrap();
        Ok(())
    })
    .unwrap();
    let addr = addr_rx.recv().unwrap();

    let payload = b"twelve bytes".to_vec();
    let (code, response) = HttpClient::request_sync(
        "POST",
        &format!("http://{addr}/echo"),
        payload.clone(),
        RequestOption::default(),
    )
    .unwrap();

    assert_eq!(code, 0);
    assert_eq!(response.status_code, 200);
    assert_eq!(response.body, payload);

    server.stop();
    server.join();
}

#[test]
fn unrouted_requests_get_404() {
    let (addr_tx, addr_rx) = mpsc::channel();

    let server = NetThread::spawn("empty-http", move |ctx| {
        let server = HttpServer::open(ctx, "127.0.0.1:0".parse().unwrap())?;
        server.set_request_handler("/known", |_ctx, channel| {
            channel.send_status(200, "", "ok");
            channel.close();
        });
        addr_tx.send(server.local_endpoint()).unwrap();
        Ok(())
    })
    .unwrap();
    let addr = addr_rx.recv().unwrap();

    let (code, response) = HttpClient::request_sync(
        "GET",
        &format!("http://{addr}/unknown"),
        Vec::new(),
        RequestOption::default(),
    )
    .unwrap();
    assert_eq!(code, 0);
    assert_eq!(response.status_code, 404);

    server.stop();
    server.join();
}

#[test]
fn redirects_are_followed_and_303_downgrades_to_get() {
    let (addr_tx, addr_rx) = mpsc::channel();

    let server = NetThread::spawn("redirect-http", move |ctx| {
        let server = HttpServer::open(ctx, "127.0.0.1:0".parse().unwrap())?;
        server.set_request_handler("/start", |_ctx, channel| {
            let mut response = sirocco::HttpResponse::new(303);
            response.header.add("Location", "/end");
            channel.send_response(&mut response);
            channel.close();
        });
        server.set_request_handler("/end", |_ctx, channel| {
            let method = channel.request().method.clone();
            channel.send_status(200, "", &method);
            channel.close();
        });
        addr_tx.send(server.local_endpoint()).unwrap();
        Ok(())
    })
    .unwrap();
    let addr = addr_rx.recv().unwrap();

    let (code, response) = HttpClient::request_sync(
        "POST",
        &format!("http://{addr}/start"),
        b"payload".to_vec(),
        RequestOption::default(),
    )
    .unwrap();

    assert_eq!(code, 0);
    assert_eq!(response.status_code, 200);
    // The redirected hop arrived as GET.
    assert_eq!(response.body, b"GET");

    server.stop();
    server.join();
}

#[test]
fn redirect_cycles_terminate_with_an_error() {
    let (addr_tx, addr_rx) = mpsc::channel();

    let server = NetThread::spawn("loop-http", move |ctx| {
        let server = HttpServer::open(ctx, "127.0.0.1:0".parse().unwrap())?;
        server.set_request_handler("/a", |_ctx, channel| {
            let mut response = sirocco::HttpResponse::new(302);
            response.header.add("Location", "/b");
            channel.send_response(&mut response);
            channel.close();
        });
        server.set_request_handler("/b", |_ctx, channel| {
            let mut response = sirocco::HttpResponse::new(302);
            response.header.add("Location", "/a");
            channel.send_response(&mut response);
            channel.close();
        });
        addr_tx.send(server.local_endpoint()).unwrap();
        Ok(())
    })
    .unwrap();
    let addr = addr_rx.recv().unwrap();

    let (code, _response) = HttpClient::request_sync(
        "GET",
        &format!("http://{addr}/a"),
        Vec::new(),
        RequestOption::default(),
    )
    .unwrap();
    assert_eq!(code, error::ERR_REDIRECT_LOOP);

    server.stop();
    server.join();
}

#[test]
fn multi_worker_server_answers_consecutive_requests() {
    let (addr_tx, addr_rx) = mpsc::channel();
    let (handle_tx, handle_rx) = mpsc::channel();

    let app_thread = std::thread::spawn(move || {
        let mut option = ServerOption::default();
        option.workers = 2;
        let mut app = HttpServerApp::new(option).unwrap();
        app.set_request_handler("/", |ctx, channel| {
            channel.send_status(200, "", ctx.name());
            channel.close();
        });
        let addr = app.open("127.0.0.1:0".parse().unwrap()).unwrap();
        addr_tx.send(addr).unwrap();
        handle_tx.send(app.handle()).unwrap();
        app.run();
    });

    let addr = addr_rx.recv_timeout(Duration::from_secs(10)).unwrap();
    let handle = handle_rx.recv().unwrap();

    let mut seen_workers = Vec::new();
    for _ in 0..4 {
        let (code, response) = HttpClient::request_sync(
            "GET",
            &format!("http://{addr}/"),
            Vec::new(),
            RequestOption::default(),
        )
        .unwrap();
        assert_eq!(code, 0);
        assert_eq!(response.status_code, 200);
        seen_workers.push(response.body_as_string());
    }

    // Round-robin across two workers.
    assert!(seen_workers.iter().any(|name| name.ends_with("-0")));
    assert!(seen_workers.iter().any(|name| name.ends_with("-1")));

    handle.stop();
    app_thread.join().unwrap();
}
