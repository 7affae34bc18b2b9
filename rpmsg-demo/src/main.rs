//! A small client/server demo exercising [`rpmsg_socket`] over its
//! in-process [`rpmsg_socket::testbus::InMemoryBus`], in the spirit of
//! elvis's `socket_server`/`socket_client` example applications: a server
//! accepts a fixed number of clients, each exchanges a request/response
//! pair, and the server shuts down once every client has been served.

use rpmsg_socket::{
    bus::PeerCredentials,
    socket::{SockType, Socket},
    testbus::InMemoryBus,
    RpmsgAddress,
};
use std::sync::Arc;

const NUM_CLIENTS: u16 = 3;
const SERVICE_NAME: &str = "echo";
const SERVER_CPU: &str = "cpu1";
const CLIENT_CPU: &str = "cpu0";

async fn serve_one_client(socket: Socket, client_num: u16) {
    let (request, _) = socket.recvmsg(256).await.unwrap();
    tracing::info!(client_num, request = %String::from_utf8_lossy(&request), "server: request received");

    let response = format!("({client_num}) ack");
    socket.sendmsg(response.as_bytes()).await.unwrap();
    socket.close();
}

async fn run_server(bus: Arc<dyn rpmsg_socket::RpmsgBus>) {
    let creds = PeerCredentials { pid: std::process::id(), uid: 0, gid: 0 };
    let listener = Socket::setup(SockType::Stream, creds, bus);
    listener.bind(RpmsgAddress::new(SERVICE_NAME, "")).unwrap();
    listener.listen(NUM_CLIENTS as usize).unwrap();
    tracing::info!("server: listening on {SERVICE_NAME}");

    let mut tasks = Vec::new();
    for client_num in 1..=NUM_CLIENTS {
        let (socket, peer) = listener.accept().await.unwrap();
        tracing::info!(client_num, peer = ?peer, "server: accepted connection");
        tasks.push(tokio::spawn(serve_one_client(socket, client_num)));
    }
    for task in tasks {
        task.await.unwrap();
    }
    listener.close();
    tracing::info!("server: shut down");
}

async fn run_client(bus: Arc<dyn rpmsg_socket::RpmsgBus>, client_num: u16) {
    let creds = PeerCredentials { pid: std::process::id(), uid: 1000, gid: 1000 };
    let socket = Socket::setup(SockType::Stream, creds, bus);
    socket
        .connect(RpmsgAddress::new(SERVICE_NAME, SERVER_CPU))
        .await
        .unwrap();

    let request = format!("({client_num}) hello");
    socket.sendmsg(request.as_bytes()).await.unwrap();

    let (response, _) = socket.recvmsg(256).await.unwrap();
    tracing::info!(client_num, response = %String::from_utf8_lossy(&response), "client: response received");
    socket.close();
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let fabric = InMemoryBus::shared(CLIENT_CPU, SERVER_CPU);
    let server = tokio::spawn(run_server(fabric.side(SERVER_CPU)));

    let mut clients = Vec::new();
    for client_num in 1..=NUM_CLIENTS {
        clients.push(tokio::spawn(run_client(fabric.side(CLIENT_CPU), client_num)));
    }
    for client in clients {
        client.await.unwrap();
    }
    server.await.unwrap();
}
