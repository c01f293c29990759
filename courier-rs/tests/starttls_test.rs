//! STARTTLS upgrade and implicit TLS tests

mod common;

use common::{start_smtp, Conversation, Options, TestServer};
use courier_rs::security::tls::self_signed;
use courier_rs::security::TlsConfig;
use rustls::{Certificate, ClientConfig, RootCertStore, ServerName};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

async fn start_tls_server() -> (TestServer, TlsConnector) {
    let generated = self_signed("localhost").unwrap();
    let tls = TlsConfig::from_pem(generated.cert_pem.as_bytes(), generated.key_pem.as_bytes())
        .unwrap();

    let mut roots = RootCertStore::empty();
    for der in rustls_pemfile::certs(&mut generated.cert_pem.as_bytes()).unwrap() {
        roots.add(&Certificate(der)).unwrap();
    }
    let client_config = ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(roots)
        .with_no_client_auth();

    let server = start_smtp(Options {
        tls: Some(tls),
        enable_auth: true,
        ..Default::default()
    })
    .await;
    (server, TlsConnector::from(Arc::new(client_config)))
}

async fn handshake(connector: &TlsConnector, tcp: TcpStream) -> TlsStream<TcpStream> {
    let name = ServerName::try_from("localhost").unwrap();
    connector.connect(name, tcp).await.unwrap()
}

async fn plain(addr: SocketAddr) -> Conversation<TcpStream> {
    let mut conversation = Conversation::new(TcpStream::connect(addr).await.unwrap());
    let greeting = conversation.reply().await;
    assert!(greeting[0].starts_with("220 "));
    conversation
}

#[tokio::test]
async fn test_starttls_resets_transaction_and_discards_pipelined_input() {
    let (server, connector) = start_tls_server().await;
    let mut conversation = plain(server.starttls).await;

    conversation.send(b"EHLO client.test\r\n").await;
    let lines = conversation.reply().await;
    assert!(lines.iter().any(|line| line.ends_with("STARTTLS")), "{:?}", lines);
    assert!(lines.iter().all(|line| !line.contains("AUTH")));

    // A sender given before the upgrade must not survive it
    assert_eq!(conversation.code("MAIL FROM:<early@example.org>").await, 250);

    // NOOP rides in the same segment as STARTTLS and must be dropped
    conversation.send(b"STARTTLS\r\nNOOP\r\n").await;
    let ready = conversation.reply().await;
    assert_eq!(ready, vec!["220 Ready to start TLS".to_string()]);

    let tls = handshake(&connector, conversation.into_inner()).await;
    let mut conversation = Conversation::new(tls);

    // A replayed NOOP would answer 250 here
    let (code, text) = conversation.command("RCPT TO:<alice@example.com>").await;
    assert_eq!(code, 503, "{}", text);

    assert_eq!(conversation.code("MAIL FROM:<bob@example.org>").await, 250);
    assert_eq!(conversation.code("RCPT TO:<alice@example.com>").await, 250);
    assert_eq!(conversation.code("DATA").await, 354);
    conversation.send(b"Subject: secure\r\n\r\nover tls\r\n.\r\n").await;
    let reply = conversation.reply().await;
    assert!(reply[0].starts_with("250"), "{:?}", reply);

    let messages = server.processor.messages();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].sender, "bob@example.org");
    assert_eq!(messages[0].data, b"Subject: secure\r\n\r\nover tls\r\n".to_vec());

    // Upgraded sessions neither offer nor accept STARTTLS again
    conversation.send(b"EHLO client.test\r\n").await;
    let lines = conversation.reply().await;
    assert!(lines.iter().all(|line| !line.contains("STARTTLS")), "{:?}", lines);
    assert!(lines.iter().any(|line| line.ends_with("AUTH PLAIN LOGIN")));
    assert_eq!(conversation.code("STARTTLS").await, 503);
}

#[tokio::test]
async fn test_starttls_requires_ehlo() {
    let (server, _) = start_tls_server().await;
    let mut conversation = plain(server.starttls).await;
    assert_eq!(conversation.code("STARTTLS").await, 503);

    // HELO does not advertise extensions, so STARTTLS stays unavailable
    assert_eq!(conversation.code("HELO client.test").await, 250);
    assert_eq!(conversation.code("STARTTLS").await, 503);

    assert_eq!(conversation.code("EHLO client.test").await, 250);
    conversation.send(b"STARTTLS\r\n").await;
    assert_eq!(conversation.reply().await, vec!["220 Ready to start TLS".to_string()]);
}

#[tokio::test]
async fn test_implicit_tls_port() {
    let (server, connector) = start_tls_server().await;
    let addr = server.implicit.expect("implicit TLS listener");

    let tls = handshake(&connector, TcpStream::connect(addr).await.unwrap()).await;
    let mut conversation = Conversation::new(tls);
    let greeting = conversation.reply().await;
    assert!(greeting[0].starts_with("220 mx.test"));

    conversation.send(b"EHLO client.test\r\n").await;
    let lines = conversation.reply().await;
    assert!(lines.iter().all(|line| !line.contains("STARTTLS")));
    assert_eq!(conversation.code("STARTTLS").await, 502);

    assert_eq!(conversation.code("MAIL FROM:<bob@example.org>").await, 250);
    assert_eq!(conversation.code("RCPT TO:<alice@example.com>").await, 250);
    assert_eq!(conversation.code("DATA").await, 354);
    conversation.send(b"Subject: implicit\r\n\r\nhello\r\n.\r\n").await;
    assert!(conversation.reply().await[0].starts_with("250"));

    assert_eq!(server.processor.messages().len(), 1);
    assert!(server.forwarder.messages().is_empty());
}
