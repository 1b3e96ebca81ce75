//! Tunnels between a client and a server over the in-memory network, forwarding to an echo
//!  service.

use std::sync::Arc;
use std::time::Duration;
use bytes::{Bytes, BytesMut};
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;

use crate::client::TunnelClient;
use crate::config::{ClientConfig, ServerConfig, TunnelConfig, DEFAULT_PROTOCOL_ID};
use crate::net::{BoxStream, Connector};
use crate::protocol::{initiator_handshake, read_frame, Frame, Packet, Payload};
use crate::server::TunnelServer;
use crate::test_util::echo_server::EchoServer;
use crate::test_util::memory_net::MemoryNet;

const TUNNEL_ADDR: &str = "tunnel:7000";
const ECHO_ADDR: &str = "echo:7";

struct Setup {
    net: Arc<MemoryNet>,
    echo: EchoServer,
    server: TunnelServer,
    client: TunnelClient,
}

fn serve_tunnel(server: TunnelServer, mut listener: mpsc::UnboundedReceiver<BoxStream>) {
    tokio::spawn(async move {
        while let Some(stream) = listener.recv().await {
            let server = server.clone();
            tokio::spawn(async move {
                let _ = server.adopt(stream).await;
            });
        }
    });
}

async fn setup_with_destination(destination: &str) -> Setup {
    let net = MemoryNet::new();
    let echo = EchoServer::spawn(net.listen(ECHO_ADDR).await);

    let server = TunnelServer::new(TunnelConfig::default(), ServerConfig { destination: destination.to_string() }, net.clone()).unwrap();
    serve_tunnel(server.clone(), net.listen(TUNNEL_ADDR).await);

    let client = TunnelClient::new(TunnelConfig::default(), ClientConfig { candidates: vec![TUNNEL_ADDR.to_string()] }, net.clone()).unwrap();

    Setup { net, echo, server, client }
}

async fn setup() -> Setup {
    setup_with_destination(ECHO_ADDR).await
}

fn open_user_connection(client: &TunnelClient) -> (DuplexStream, JoinHandle<()>) {
    let (user, user_side) = duplex(64*1024);
    let session = client.adopt(Box::new(user_side));
    (user, session)
}

async fn read_n(stream: &mut DuplexStream, n: usize) -> Vec<u8> {
    let mut buf = vec![0u8; n];
    stream.read_exact(&mut buf).await.unwrap();
    buf
}

#[tokio::test(start_paused = true)]
async fn test_echo_round_trip() {
    let setup = setup().await;
    let (mut user, session) = open_user_connection(&setup.client);

    user.write_all(b"hello").await.unwrap();
    user.shutdown().await.unwrap();

    let mut received = Vec::new();
    user.read_to_end(&mut received).await.unwrap();
    assert_eq!(received, b"HELLO");

    session.await.unwrap();
    sleep(Duration::from_millis(100)).await;

    assert_eq!(setup.echo.log_entries().await, vec!["1 connected", "1 hello", "1 end"]);
    assert!(setup.server.registry().is_empty().await);
    assert_eq!(setup.net.connection_count(TUNNEL_ADDR).await, 1);
}

#[tokio::test(start_paused = true)]
async fn test_paused_link_is_replaced_without_duplicates() {
    let setup = setup().await;
    let (mut user, session) = open_user_connection(&setup.client);

    sleep(Duration::from_millis(10)).await;
    setup.net.pause_all().await;
    user.write_all(b"hello").await.unwrap();

    assert_eq!(read_n(&mut user, 5).await, b"HELLO");
    assert_eq!(setup.net.connection_count(TUNNEL_ADDR).await, 2);

    user.shutdown().await.unwrap();
    let mut rest = Vec::new();
    user.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());
    session.await.unwrap();

    assert_eq!(setup.echo.received().await, b"hello");
    assert_eq!(setup.echo.log_entries().await, vec!["1 connected", "1 hello", "1 end"]);
}

#[tokio::test(start_paused = true)]
async fn test_repeated_severing_while_streaming() {
    let setup = setup().await;
    let (mut user, session) = open_user_connection(&setup.client);

    let mut sent = Vec::new();
    for i in 0..40 {
        let chunk = format!("chunk {:02};", i);
        user.write_all(chunk.as_bytes()).await.unwrap();
        sent.extend_from_slice(chunk.as_bytes());

        if i % 7 == 3 {
            setup.net.sever_all().await;
        }
        sleep(Duration::from_millis(300)).await;
    }
    user.shutdown().await.unwrap();

    let mut received = Vec::new();
    user.read_to_end(&mut received).await.unwrap();
    assert_eq!(received, sent.to_ascii_uppercase());
    session.await.unwrap();

    assert_eq!(setup.echo.received().await, sent);
    assert!(setup.net.connection_count(TUNNEL_ADDR).await > 1);
}

#[tokio::test(start_paused = true)]
async fn test_client_retries_until_a_tunnel_server_is_reachable() {
    let setup = setup().await;
    setup.net.stop_listening(TUNNEL_ADDR).await;

    let (mut user, session) = open_user_connection(&setup.client);
    user.write_all(b"hello").await.unwrap();

    sleep(TunnelConfig::default().reconnect_delay * 3).await;
    assert_eq!(setup.net.connection_count(TUNNEL_ADDR).await, 0);

    serve_tunnel(setup.server.clone(), setup.net.listen(TUNNEL_ADDR).await);
    assert_eq!(read_n(&mut user, 5).await, b"HELLO");
    assert_eq!(setup.net.connection_count(TUNNEL_ADDR).await, 1);

    user.shutdown().await.unwrap();
    let mut rest = Vec::new();
    user.read_to_end(&mut rest).await.unwrap();
    session.await.unwrap();
    assert_eq!(setup.echo.log_entries().await, vec!["1 connected", "1 hello", "1 end"]);
}

#[tokio::test(start_paused = true)]
async fn test_idle_link_is_kept_alive() {
    let setup = setup().await;
    let (mut user, _session) = open_user_connection(&setup.client);

    sleep(Duration::from_secs(30)).await;
    assert_eq!(setup.net.connection_count(TUNNEL_ADDR).await, 1);

    user.write_all(b"still there").await.unwrap();
    assert_eq!(read_n(&mut user, 11).await, b"STILL THERE");
}

#[tokio::test(start_paused = true)]
async fn test_silent_link_times_out_and_reconnects() {
    let setup = setup().await;
    let (_user, _session) = open_user_connection(&setup.client);

    sleep(Duration::from_millis(10)).await;
    setup.net.pause_all().await;

    sleep(Duration::from_secs(4)).await;
    assert_eq!(setup.net.connection_count(TUNNEL_ADDR).await, 1);

    sleep(Duration::from_secs(4)).await;
    assert_eq!(setup.net.connection_count(TUNNEL_ADDR).await, 2);
    assert_eq!(setup.server.registry().len().await, 1);
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_destination_ends_session() {
    let setup = setup_with_destination("nowhere:1").await;
    let (mut user, session) = open_user_connection(&setup.client);

    let mut received = Vec::new();
    user.read_to_end(&mut received).await.unwrap();
    assert!(received.is_empty());

    user.write_all(b"discarded").await.unwrap();
    user.shutdown().await.unwrap();
    session.await.unwrap();

    sleep(Duration::from_millis(100)).await;
    assert!(setup.server.registry().is_empty().await);
    assert!(setup.echo.log_entries().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_restarted_server_rejects_resumption() {
    let setup = setup().await;
    let (mut user, session) = open_user_connection(&setup.client);

    user.write_all(b"hello").await.unwrap();
    assert_eq!(read_n(&mut user, 5).await, b"HELLO");

    // a fresh server with an empty registry takes over the address
    let restarted = TunnelServer::new(TunnelConfig::default(), ServerConfig { destination: ECHO_ADDR.to_string() }, setup.net.clone()).unwrap();
    serve_tunnel(restarted.clone(), setup.net.listen(TUNNEL_ADDR).await);
    setup.net.sever_all().await;

    let mut rest = Vec::new();
    let _ = user.read_to_end(&mut rest).await;
    session.await.unwrap();

    sleep(Duration::from_secs(10)).await;
    assert_eq!(setup.net.connection_count(TUNNEL_ADDR).await, 2);
    assert!(restarted.registry().is_empty().await);
}

// The following tests talk to the server directly on the wire

async fn write_frame(stream: &mut BoxStream, frame: Frame) {
    let mut buf = BytesMut::new();
    frame.ser(&mut buf);
    stream.write_all(&buf).await.unwrap();
}

async fn raw_session(net: &MemoryNet, identity: &str, last_received: u64) -> BoxStream {
    let mut transport = net.connect(TUNNEL_ADDR).await.unwrap();
    initiator_handshake(&mut transport, DEFAULT_PROTOCOL_ID, identity).await.unwrap();
    write_frame(&mut transport, Frame::ReplayRequest { last_received }).await;
    transport
}

async fn next_frame(transport: &mut BoxStream) -> Frame {
    read_frame(transport, 1024).await.unwrap().unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_unknown_session_is_rejected() {
    let setup = setup().await;
    let mut transport = raw_session(&setup.net, "no-such-session", 3).await;

    assert_eq!(next_frame(&mut transport).await, Frame::UnknownSession);
    assert_eq!(read_frame(&mut transport, 1024).await.unwrap(), None);

    assert!(setup.server.registry().is_empty().await);
    assert!(setup.echo.log_entries().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_resumption_replays_unacknowledged_packets() {
    let setup = setup().await;
    let mut transport = raw_session(&setup.net, "raw-session", 0).await;
    assert_eq!(next_frame(&mut transport).await, Frame::ReplayRequest { last_received: 0 });

    // send three packets, and record everything the server sends without acknowledging it
    let mut from_server = Vec::new();
    for (i, s) in ["a", "b", "c"].into_iter().enumerate() {
        write_frame(&mut transport, Frame::Packet(Packet { sequence: i as u64 + 1, payload: Payload::Data(Bytes::from(s)) })).await;
        loop {
            match next_frame(&mut transport).await {
                Frame::Packet(packet) => {
                    let is_echo = packet.payload == Payload::Data(Bytes::from(s.to_uppercase()));
                    from_server.push(packet);
                    if is_echo {
                        break;
                    }
                }
                other => panic!("unexpected frame {:?}", other),
            }
        }
    }
    let k = from_server.last().unwrap().sequence;
    assert_eq!(from_server.iter().map(|p| p.sequence).collect::<Vec<_>>(), (1..=k).collect::<Vec<_>>());

    drop(transport);
    let mut transport = raw_session(&setup.net, "raw-session", 1).await;
    assert_eq!(next_frame(&mut transport).await, Frame::ReplayRequest { last_received: 3 });

    for expected in &from_server[1..] {
        assert_eq!(next_frame(&mut transport).await, Frame::Packet(expected.clone()));
    }
    assert_eq!(setup.server.registry().len().await, 1);
    assert_eq!(setup.echo.log_entries().await, vec!["1 connected", "1 a", "1 b", "1 c"]);
}

#[tokio::test(start_paused = true)]
async fn test_session_ends_when_final_ack_is_lost() {
    let setup = setup().await;
    let mut transport = raw_session(&setup.net, "ending", 0).await;
    assert_eq!(next_frame(&mut transport).await, Frame::ReplayRequest { last_received: 0 });

    // our END makes the destination close, which makes the server send its own END
    write_frame(&mut transport, Frame::Packet(Packet { sequence: 1, payload: Payload::End })).await;
    loop {
        match next_frame(&mut transport).await {
            Frame::Packet(Packet { payload: Payload::End, .. }) => break,
            Frame::Packet(_) => {}
            other => panic!("unexpected frame {:?}", other),
        }
    }

    // the connection goes away before the server's END is acknowledged
    drop(transport);
    sleep(Duration::from_secs(5)).await;
    assert_eq!(setup.server.registry().len().await, 1);

    sleep(TunnelConfig::default().end_linger).await;
    assert!(setup.server.registry().is_empty().await);
    assert_eq!(setup.echo.log_entries().await, vec!["1 connected", "1 end"]);
}
