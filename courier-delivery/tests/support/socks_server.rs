//! A single-connection SOCKS5 relay that records what the client asked for.
#![allow(dead_code)]

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt, copy_bidirectional},
    net::{TcpListener, TcpStream},
    sync::oneshot,
};

const VERSION: u8 = 0x05;
const NO_AUTH: u8 = 0x00;
const PASSWORD_AUTH: u8 = 0x02;
const CONNECT: u8 = 0x01;

/// What the relay saw before it started forwarding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tunnel {
    pub target: SocketAddr,
    pub credentials: Option<(String, String)>,
}

/// Accepts one client, opens the requested tunnel and relays until either
/// side closes. Password authentication is chosen whenever it is offered.
///
/// The tunnel is reported as soon as it is open.
pub async fn relay_once() -> (u16, oneshot::Receiver<Tunnel>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (report, tunnel) = oneshot::channel();

    tokio::spawn(async move {
        let (mut client, _) = listener.accept().await.unwrap();
        let credentials = negotiate(&mut client).await;
        let target = read_connect(&mut client).await;

        let mut upstream = TcpStream::connect(target).await.unwrap();
        client
            .write_all(&[VERSION, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
            .await
            .unwrap();
        let _ = report.send(Tunnel { target, credentials });
        let _ = copy_bidirectional(&mut client, &mut upstream).await;
    });

    (port, tunnel)
}

async fn negotiate(client: &mut TcpStream) -> Option<(String, String)> {
    let mut header = [0u8; 2];
    client.read_exact(&mut header).await.unwrap();
    assert_eq!(header[0], VERSION);
    let mut methods = vec![0u8; usize::from(header[1])];
    client.read_exact(&mut methods).await.unwrap();

    if !methods.contains(&PASSWORD_AUTH) {
        assert!(methods.contains(&NO_AUTH));
        client.write_all(&[VERSION, NO_AUTH]).await.unwrap();
        return None;
    }

    client.write_all(&[VERSION, PASSWORD_AUTH]).await.unwrap();
    let mut version = [0u8; 1];
    client.read_exact(&mut version).await.unwrap();
    let username = read_short_string(client).await;
    let password = read_short_string(client).await;
    client.write_all(&[0x01, 0x00]).await.unwrap();
    Some((username, password))
}

async fn read_connect(client: &mut TcpStream) -> SocketAddr {
    let mut request = [0u8; 4];
    client.read_exact(&mut request).await.unwrap();
    assert_eq!(request[0], VERSION);
    assert_eq!(request[1], CONNECT);

    let ip = match request[3] {
        0x01 => {
            let mut octets = [0u8; 4];
            client.read_exact(&mut octets).await.unwrap();
            Ipv4Addr::from(octets).into()
        }
        0x04 => {
            let mut octets = [0u8; 16];
            client.read_exact(&mut octets).await.unwrap();
            Ipv6Addr::from(octets).into()
        }
        other => panic!("unsupported address type {other}"),
    };
    let port = client.read_u16().await.unwrap();
    SocketAddr::new(ip, port)
}

async fn read_short_string(client: &mut TcpStream) -> String {
    let length = client.read_u8().await.unwrap();
    let mut bytes = vec![0u8; usize::from(length)];
    client.read_exact(&mut bytes).await.unwrap();
    String::from_utf8(bytes).unwrap()
}
