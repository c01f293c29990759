//! SMTP ingress tests against live listeners on loopback ports

mod common;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use common::{start_smtp, Conversation, Options, Recorder, PASSWORD, USER};
use std::net::SocketAddr;
use tokio::net::TcpStream;

async fn connect(addr: SocketAddr) -> Conversation<TcpStream> {
    let stream = TcpStream::connect(addr).await.unwrap();
    let mut conversation = Conversation::new(stream);
    let greeting = conversation.reply().await;
    assert!(greeting[0].starts_with("220 mx.test"), "{:?}", greeting);
    conversation
}

async fn send_message(conversation: &mut Conversation<TcpStream>, body: &[u8]) -> (u16, String) {
    assert_eq!(conversation.code("MAIL FROM:<bob@example.org>").await, 250);
    assert_eq!(conversation.code("RCPT TO:<alice@example.com>").await, 250);
    assert_eq!(conversation.code("DATA").await, 354);
    conversation.send(body).await;
    let reply = conversation.reply().await;
    let last = reply.last().cloned().unwrap_or_default();
    (last[..3].parse().unwrap(), last)
}

#[tokio::test]
async fn test_data_terminator_and_dot_unstuffing() {
    let server = start_smtp(Options::default()).await;
    let mut conversation = connect(server.starttls).await;
    assert_eq!(conversation.code("EHLO client.test").await, 250);

    let (code, text) = send_message(
        &mut conversation,
        b"Subject: dots\r\n\r\n..\r\n. \r\n..leading\r\n.x\r\n.\r\n",
    )
    .await;
    assert_eq!(code, 250, "{}", text);

    let messages = server.processor.messages();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].sender, "bob@example.org");
    assert_eq!(messages[0].recipients, vec!["alice@example.com".to_string()]);
    assert_eq!(
        messages[0].data,
        b"Subject: dots\r\n\r\n.\r\n \r\n.leading\r\nx\r\n".to_vec()
    );
    assert!(server.forwarder.messages().is_empty());

    // The session is ready for another transaction without a new EHLO
    assert_eq!(conversation.code("MAIL FROM:<>").await, 250);
    assert_eq!(conversation.code("QUIT").await, 221);
}

#[tokio::test]
async fn test_forward_port_uses_forwarder() {
    let server = start_smtp(Options::default()).await;
    let mut conversation = connect(server.forward.unwrap()).await;
    assert_eq!(conversation.code("HELO client.test").await, 250);

    let (code, _) = send_message(&mut conversation, b"Subject: relay\r\n\r\nhi\r\n.\r\n").await;
    assert_eq!(code, 250);

    assert_eq!(server.forwarder.messages().len(), 1);
    assert!(server.processor.messages().is_empty());
}

#[tokio::test]
async fn test_delivery_failure_is_rejected() {
    let server = start_smtp(Options {
        processor: Recorder::failing(),
        ..Default::default()
    })
    .await;
    let mut conversation = connect(server.starttls).await;
    assert_eq!(conversation.code("EHLO client.test").await, 250);

    let (code, text) = send_message(&mut conversation, b"Subject: x\r\n\r\nbody\r\n.\r\n").await;
    assert_eq!(code, 550, "{}", text);

    // A failed delivery does not poison the session
    assert_eq!(conversation.code("NOOP").await, 250);
}

#[tokio::test]
async fn test_command_sequence_errors() {
    let server = start_smtp(Options::default()).await;
    let mut conversation = connect(server.starttls).await;

    assert_eq!(conversation.code("MAIL FROM:<bob@example.org>").await, 503);
    assert_eq!(conversation.code("EHLO client.test").await, 250);
    assert_eq!(conversation.code("RCPT TO:<alice@example.com>").await, 503);
    assert_eq!(conversation.code("DATA").await, 503);

    assert_eq!(conversation.code("MAIL FROM:<bob@example.org>").await, 250);
    assert_eq!(conversation.code("MAIL FROM:<carol@example.org>").await, 503);
    assert_eq!(conversation.code("DATA").await, 503);

    assert_eq!(conversation.code("RSET").await, 250);
    assert_eq!(conversation.code("RCPT TO:<alice@example.com>").await, 503);
    assert_eq!(conversation.code("MAIL FROM:<carol@example.org>").await, 250);

    assert_eq!(conversation.code("RCPT TO:<>").await, 501);
    assert_eq!(conversation.code("FROB").await, 502);
    assert_eq!(conversation.code("NOOP").await, 250);
}

#[tokio::test]
async fn test_recipient_limit() {
    let server = start_smtp(Options {
        max_recipients: 2,
        ..Default::default()
    })
    .await;
    let mut conversation = connect(server.starttls).await;
    assert_eq!(conversation.code("EHLO client.test").await, 250);
    assert_eq!(conversation.code("MAIL FROM:<bob@example.org>").await, 250);
    assert_eq!(conversation.code("RCPT TO:<a@example.com>").await, 250);
    assert_eq!(conversation.code("RCPT TO:<b@example.com>").await, 250);
    assert_eq!(conversation.code("RCPT TO:<c@example.com>").await, 452);
}

#[tokio::test]
async fn test_message_size_limit() {
    let server = start_smtp(Options {
        max_message_size: 64,
        ..Default::default()
    })
    .await;
    let mut conversation = connect(server.starttls).await;
    assert_eq!(conversation.code("EHLO client.test").await, 250);

    let mut body = b"Subject: big\r\n\r\n".to_vec();
    for _ in 0..10 {
        body.extend_from_slice(b"0123456789012345678901234567890123456789\r\n");
    }
    body.extend_from_slice(b".\r\n");

    let (code, text) = send_message(&mut conversation, &body).await;
    assert_eq!(code, 552, "{}", text);
    assert!(server.processor.messages().is_empty());
}

#[tokio::test]
async fn test_ehlo_capabilities_per_mode() {
    let server = start_smtp(Options {
        enable_auth: true,
        ..Default::default()
    })
    .await;

    let mut conversation = connect(server.forward.unwrap()).await;
    conversation.send(b"EHLO client.test\r\n").await;
    let lines = conversation.reply().await;
    assert_eq!(lines[0], "250-mx.test Hello client.test");
    assert!(lines.iter().any(|line| line.ends_with("AUTH PLAIN LOGIN")));
    assert!(lines.iter().all(|line| !line.contains("STARTTLS")));

    // Without a certificate the STARTTLS port offers neither TLS nor AUTH
    let mut conversation = connect(server.starttls).await;
    conversation.send(b"EHLO client.test\r\n").await;
    let lines = conversation.reply().await;
    assert!(lines.iter().all(|line| !line.contains("STARTTLS")));
    assert!(lines.iter().all(|line| !line.contains("AUTH")));
    assert_eq!(conversation.code("STARTTLS").await, 502);
    assert_eq!(conversation.code("AUTH PLAIN").await, 530);

    assert!(server.implicit.is_none());
}

#[tokio::test]
async fn test_auth_plain_and_login() {
    let server = start_smtp(Options {
        enable_auth: true,
        ..Default::default()
    })
    .await;
    let addr = server.forward.unwrap();

    let mut conversation = connect(addr).await;
    assert_eq!(conversation.code("EHLO client.test").await, 250);
    assert_eq!(conversation.code("AUTH CRAM-MD5").await, 504);

    let wrong = BASE64.encode(format!("\0{}\0nope", USER));
    assert_eq!(conversation.code(&format!("AUTH PLAIN {}", wrong)).await, 535);

    let right = BASE64.encode(format!("\0{}\0{}", USER, PASSWORD));
    assert_eq!(conversation.code(&format!("AUTH PLAIN {}", right)).await, 235);
    assert_eq!(conversation.code(&format!("AUTH PLAIN {}", right)).await, 503);

    let mut conversation = connect(addr).await;
    assert_eq!(conversation.code("EHLO client.test").await, 250);
    let (code, text) = conversation.command("AUTH LOGIN").await;
    assert_eq!((code, text.as_str()), (334, "334 VXNlcm5hbWU6"));
    let (code, text) = conversation.command(&BASE64.encode(USER)).await;
    assert_eq!((code, text.as_str()), (334, "334 UGFzc3dvcmQ6"));
    assert_eq!(conversation.code(&BASE64.encode(PASSWORD)).await, 235);

    let mut conversation = connect(addr).await;
    assert_eq!(conversation.code("EHLO client.test").await, 250);
    assert_eq!(conversation.code("AUTH LOGIN").await, 334);
    assert_eq!(conversation.code("*").await, 501);
    assert_eq!(conversation.code("NOOP").await, 250);
}
