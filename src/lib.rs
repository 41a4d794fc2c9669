//! An event-driven network application framework.
//!
//! Server and client applications multiplex TCP, UDP, TLS, HTTP and
//! WebSocket I/O on cooperatively scheduled worker threads, each driven by
//! a single-threaded event loop with integrated timers. Cross-thread
//! communication happens exclusively by posting events; every socket has a
//! single owning thread and all of its callbacks run there.
//!
//! The layers, bottom up:
//!
//! - [`EventLoop`] merges queued events, expiring timers and socket
//!   readiness into one serialized dispatch stream.
//! - [`NetThread`] / [`Application`] host one loop per thread, with task
//!   posting and parent/child exit notifications.
//! - [`SocketController`] owns the thread's sockets and turns readiness
//!   into [`TcpServer`] / [`TcpChannel`] / [`UdpReceiver`] callbacks.
//! - [`HttpClient`] / [`HttpServer`] speak HTTP/1.1 on top, including
//!   chunked bodies and redirects; [`WsChannel`] takes over an upgraded
//!   connection with the RFC 6455 frame machinery.

mod cursor;
mod endpoint;
pub mod error;
mod event;
mod event_loop;
mod http;
mod http_client;
mod http_server;
mod queue;
mod selector;
mod socket;
mod socket_controller;
mod tcp;
mod thread;
mod timer;
mod tls;
mod udp;
pub mod ws;

pub use cursor::ByteReader;
pub use cursor::ByteWriter;
pub use endpoint::resolve;
pub use endpoint::resolve_address;
pub use event::event_id;
pub use event::Event;
pub use event::EventId;
pub use event_loop::Context;
pub use event_loop::EventLoop;
pub use event_loop::Status;
pub use event_loop::Task;
pub use http::encode_chunk;
pub use http::encode_chunked;
pub use http::encode_last_chunk;
pub use http::status;
pub use http::status_message;
pub use http::ChunkDecoder;
pub use http::HeaderField;
pub use http::HttpHeader;
pub use http::HttpRequest;
pub use http::HttpResponse;
pub use http::HttpUrl;
pub use http_client::HttpClient;
pub use http_client::RequestOption;
pub use http_server::HttpChannel;
pub use http_server::HttpHandlerMap;
pub use http_server::HttpRequestHandler;
pub use http_server::HttpServer;
pub use http_server::HttpServerApp;
pub use http_server::ServerOption;
pub use queue::DefaultController;
pub use queue::EventController;
pub use queue::EventQueue;
pub use queue::WaitResult;
pub use selector::Selector;
pub use selector::SocketEvents;
pub use selector::MAX_SOCKETS;
pub use socket::SocketOption;
pub use socket_controller::ChannelId;
pub use socket_controller::SocketController;
pub use socket_controller::DEFAULT_CLOSE_TIMEOUT_MS;
pub use tcp::TcpChannel;
pub use tcp::TcpClient;
pub use tcp::TcpServer;
pub use thread::Application;
pub use thread::ChildFinished;
pub use thread::NetThread;
pub use thread::ThreadHandle;
pub use timer::Timer;
pub use timer::TimerId;
pub use timer::TimerManager;
pub use tls::TlsClientContext;
pub use tls::TlsServerContext;
pub use udp::UdpReceiver;
pub use udp::UdpSender;
pub use ws::WsChannel;
pub use ws::WsFrame;
