//! IMAP protocol tests against a live server on a loopback port

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use courier_rs::config::Config;
use courier_rs::imap::ImapServer;
use courier_rs::security::StaticCredentials;
use courier_rs::storage::{summarize, MemoryStore};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};

const USER: &str = "alice@example.com";
const PASSWORD: &str = "secret";

const MESSAGES: [&[u8]; 3] = [
    b"From: Bea <b@example.com>\r\nTo: alice@example.com\r\nSubject: first\r\nDate: Mon, 01 Jan 2024 09:00:00 +0000\r\n\r\nOne\r\n",
    b"From: Al <a@example.com>\r\nTo: alice@example.com\r\nSubject: second\r\nDate: Wed, 03 Jan 2024 09:00:00 +0000\r\n\r\nTwo\r\n",
    b"From: Al <a@example.com>\r\nTo: alice@example.com\r\nSubject: third\r\nDate: Tue, 02 Jan 2024 09:00:00 +0000\r\n\r\nThree\r\n",
];

/// Helper function to start a test IMAP server
async fn start_test_server() -> SocketAddr {
    let store = Arc::new(MemoryStore::new());
    store.create_mailbox(USER, "INBOX");
    store.create_mailbox(USER, "Archive");
    for raw in MESSAGES {
        store.insert(USER, "INBOX", summarize(raw), raw.to_vec());
    }

    let mut config = Config::default().imap;
    config.listen_addr = "127.0.0.1:0".to_string();
    config.max_literal_size = 1024;

    let server = ImapServer::new(
        config,
        store.clone(),
        store,
        Arc::new(StaticCredentials::new().with_user(USER, PASSWORD)),
    );
    let listener = server.bind().await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(server.serve(listener));
    addr
}

struct Client {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Client {
    async fn connect(addr: SocketAddr) -> (Self, String) {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (reader, writer) = stream.into_split();
        let mut client = Self {
            reader: BufReader::new(reader),
            writer,
        };
        let greeting = client.read_line().await;
        (client, greeting)
    }

    async fn login(addr: SocketAddr) -> Self {
        let (mut client, _) = Self::connect(addr).await;
        let lines = client.command("L1", &format!("LOGIN {} {}", USER, PASSWORD)).await;
        assert!(lines.last().unwrap().starts_with("L1 OK"), "{:?}", lines);
        client
    }

    async fn send(&mut self, data: &[u8]) {
        self.writer.write_all(data).await.unwrap();
    }

    async fn read_line(&mut self) -> String {
        let mut line = String::new();
        timeout(Duration::from_secs(5), self.reader.read_line(&mut line))
            .await
            .expect("timed out waiting for the server")
            .unwrap();
        line
    }

    /// Read until the tagged completion for `tag`
    async fn read_until_tagged(&mut self, tag: &str) -> Vec<String> {
        let prefix = format!("{} ", tag);
        let mut lines = Vec::new();
        loop {
            let line = self.read_line().await;
            assert!(!line.is_empty(), "connection closed, got {:?}", lines);
            let done = line.starts_with(&prefix);
            lines.push(line);
            if done {
                return lines;
            }
        }
    }

    async fn command(&mut self, tag: &str, command: &str) -> Vec<String> {
        self.send(format!("{} {}\r\n", tag, command).as_bytes()).await;
        self.read_until_tagged(tag).await
    }
}

#[tokio::test]
async fn test_greeting_and_capability() {
    let addr = start_test_server().await;
    let (mut client, greeting) = Client::connect(addr).await;
    assert!(greeting.starts_with("* OK [CAPABILITY IMAP4rev1"), "{}", greeting);

    let lines = client.command("a1", "CAPABILITY").await;
    assert!(lines[0].starts_with("* CAPABILITY IMAP4rev1"));
    assert!(lines[0].contains("SORT"));
    assert!(lines[1].starts_with("a1 OK"));
}

#[tokio::test]
async fn test_commands_require_authentication() {
    let addr = start_test_server().await;
    let (mut client, _) = Client::connect(addr).await;

    let lines = client.command("a1", "SELECT INBOX").await;
    assert_eq!(lines, vec!["a1 NO Must be authenticated\r\n".to_string()]);

    let lines = client.command("a2", &format!("LOGIN {} wrong", USER)).await;
    assert!(lines[0].starts_with("a2 NO"));

    let lines = client.command("a3", &format!("LOGIN \"{}\" {}", USER, PASSWORD)).await;
    assert!(lines[0].starts_with("a3 OK"));

    let lines = client.command("a4", "LOGIN again please").await;
    assert!(lines[0].starts_with("a4 NO"));
}

#[tokio::test]
async fn test_select_response_order() {
    let addr = start_test_server().await;
    let mut client = Client::login(addr).await;

    let lines = client.command("a2", "SELECT INBOX").await;
    let expected_prefixes = [
        "* 3 EXISTS",
        "* 0 RECENT",
        "* OK [UNSEEN 1]",
        "* OK [UIDVALIDITY ",
        "* OK [UIDNEXT 4]",
        "* FLAGS (",
        "* OK [PERMANENTFLAGS (",
        "a2 OK [READ-WRITE]",
    ];
    assert_eq!(lines.len(), expected_prefixes.len(), "{:?}", lines);
    for (line, prefix) in lines.iter().zip(expected_prefixes) {
        assert!(line.starts_with(prefix), "expected {:?}, got {:?}", prefix, line);
    }
}

#[tokio::test]
async fn test_sort_first_key_is_primary() {
    let addr = start_test_server().await;
    let mut client = Client::login(addr).await;
    client.command("a2", "SELECT INBOX").await;

    let lines = client.command("a3", "SORT (FROM DATE) UTF-8 ALL").await;
    assert_eq!(lines[0], "* SORT 3 2 1\r\n");
    assert!(lines[1].starts_with("a3 OK"));

    let lines = client.command("a4", "UID SORT (REVERSE DATE) UTF-8 ALL").await;
    assert_eq!(lines[0], "* SORT 2 3 1\r\n");

    let lines = client.command("a5", "SORT (SUBJECT) UTF-8 FROM a@example.com").await;
    assert_eq!(lines[0], "* SORT 2 3\r\n");

    let lines = client.command("a6", "SORT (FROM BOGUS) UTF-8 ALL").await;
    assert!(lines[0].starts_with("a6 BAD"), "{:?}", lines);
}

#[tokio::test]
async fn test_append_literal_split_across_reads() {
    let addr = start_test_server().await;
    let mut client = Client::login(addr).await;

    client.send(b"a2 APPEND Archive (\\Seen) {12}\r\n").await;
    let continuation = client.read_line().await;
    assert!(continuation.starts_with("+ "), "{}", continuation);

    client.send(b"Hello\r\n").await;
    sleep(Duration::from_millis(50)).await;
    client.send(b"Wor").await;
    sleep(Duration::from_millis(50)).await;
    client.send(b"ld\r\n").await;
    let lines = client.read_until_tagged("a2").await;
    assert!(lines[0].starts_with("a2 OK [APPENDUID "), "{:?}", lines);

    // Non-synchronizing literal, no continuation expected
    client.send(b"a3 APPEND Archive {3+}\r\nabc\r\n").await;
    let lines = client.read_until_tagged("a3").await;
    assert_eq!(lines.len(), 1);
    assert!(lines[0].starts_with("a3 OK"));

    client.command("a4", "SELECT Archive").await;
    let body = client.command("a5", "FETCH 1 (FLAGS BODY.PEEK[])").await.concat();
    assert!(body.contains("FLAGS (\\Seen)"), "{}", body);
    assert!(body.contains("BODY[] {12}\r\nHello\r\nWorld)"), "{}", body);
}

#[tokio::test]
async fn test_oversized_literal_is_rejected() {
    let addr = start_test_server().await;
    let mut client = Client::login(addr).await;

    client.send(b"a2 APPEND Archive {999999}\r\n").await;
    let lines = client.read_until_tagged("a2").await;
    assert!(lines[0].starts_with("a2 BAD"), "{:?}", lines);

    let lines = client.command("a3", "NOOP").await;
    assert!(lines[0].starts_with("a3 OK"));
}

#[tokio::test]
async fn test_examine_is_read_only() {
    let addr = start_test_server().await;
    let mut client = Client::login(addr).await;

    let lines = client.command("a2", "EXAMINE INBOX").await;
    assert!(lines.last().unwrap().starts_with("a2 OK [READ-ONLY]"));

    let lines = client.command("a3", "STORE 1 +FLAGS (\\Deleted)").await;
    assert!(lines[0].starts_with("a3 NO"), "{:?}", lines);

    let lines = client.command("a4", "EXPUNGE").await;
    assert!(lines[0].starts_with("a4 NO"));

    // FETCH of a body does not set \Seen in a read-only session
    client.command("a5", "FETCH 1 BODY[]").await;
    let lines = client.command("a6", "FETCH 1 (FLAGS)").await;
    assert_eq!(lines[0], "* 1 FETCH (FLAGS ())\r\n");
}

#[tokio::test]
async fn test_store_and_expunge() {
    let addr = start_test_server().await;
    let mut client = Client::login(addr).await;
    client.command("a2", "SELECT INBOX").await;

    let lines = client.command("a3", "STORE 2:3 +FLAGS (\\Deleted)").await;
    assert_eq!(lines[0], "* 2 FETCH (FLAGS (\\Deleted))\r\n");
    assert_eq!(lines[1], "* 3 FETCH (FLAGS (\\Deleted))\r\n");

    let lines = client.command("a4", "EXPUNGE").await;
    // Each EXPUNGE renumbers the messages after it
    assert_eq!(lines[0], "* 2 EXPUNGE\r\n");
    assert_eq!(lines[1], "* 2 EXPUNGE\r\n");

    let lines = client.command("a5", "SEARCH ALL").await;
    assert_eq!(lines[0], "* SEARCH 1\r\n");

    let lines = client.command("a6", "FETCH 1:x FLAGS").await;
    assert!(lines[0].starts_with("a6 BAD"));
}

#[tokio::test]
async fn test_malformed_input_recovers() {
    let addr = start_test_server().await;
    let (mut client, _) = Client::connect(addr).await;

    let lines = client.command("a1", "LOGIN \"unterminated").await;
    assert!(lines[0].starts_with("a1 BAD"), "{:?}", lines);

    let lines = client.command("a2", "FROBNICATE").await;
    assert!(lines[0].starts_with("a2 BAD"));

    let lines = client.command("a3", "NOOP").await;
    assert!(lines[0].starts_with("a3 OK"));
}

#[tokio::test]
async fn test_authenticate_plain() {
    let addr = start_test_server().await;
    let (mut client, _) = Client::connect(addr).await;

    client.send(b"a1 AUTHENTICATE PLAIN\r\n").await;
    let continuation = client.read_line().await;
    assert!(continuation.starts_with('+'));

    let answer = BASE64.encode(format!("\0{}\0{}", USER, PASSWORD));
    client.send(format!("{}\r\n", answer).as_bytes()).await;
    let lines = client.read_until_tagged("a1").await;
    assert!(lines[0].starts_with("a1 OK"), "{:?}", lines);

    let lines = client.command("a2", "LIST \"\" *").await;
    assert_eq!(lines.len(), 3, "{:?}", lines);
    assert!(lines[0].starts_with("* LIST"));
}

#[tokio::test]
async fn test_logout_closes_connection() {
    let addr = start_test_server().await;
    let (mut client, _) = Client::connect(addr).await;

    let lines = client.command("a1", "LOGOUT").await;
    assert!(lines[0].starts_with("* BYE"));
    assert!(lines[1].starts_with("a1 OK"));

    let mut rest = Vec::new();
    let n = timeout(Duration::from_secs(5), client.reader.read_to_end(&mut rest))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(n, 0);
}

#[tokio::test]
async fn test_line_breaks_in_mailbox_name_cannot_forge_responses() {
    let addr = start_test_server().await;
    let mut client = Client::login(addr).await;

    client.send(b"a2 SELECT {23}\r\n").await;
    let continuation = client.read_line().await;
    assert!(continuation.starts_with("+ "), "{}", continuation);
    client.send(b"x\r\n* BYE forged\r\nZ OK y\r\n").await;

    let lines = client.read_until_tagged("a2").await;
    assert_eq!(lines.len(), 1, "{:?}", lines);
    assert!(lines[0].starts_with("a2 BAD"), "{:?}", lines);

    let lines = client.command("a3", "NOOP").await;
    assert_eq!(lines.len(), 1);
    assert!(lines[0].starts_with("a3 OK"));
}

#[tokio::test]
async fn test_stalled_tls_handshake_is_dropped() {
    let generated = courier_rs::security::tls::self_signed("localhost").unwrap();
    let tls = courier_rs::security::TlsConfig::from_pem(
        generated.cert_pem.as_bytes(),
        generated.key_pem.as_bytes(),
    )
    .unwrap();

    let mut config = Config::default().imap;
    config.listen_addr = "127.0.0.1:0".to_string();
    config.implicit_tls = true;
    config.idle_timeout_secs = 1;

    let store = Arc::new(MemoryStore::new());
    let server = ImapServer::new(
        config,
        store.clone(),
        store,
        Arc::new(StaticCredentials::new()),
    )
    .with_tls(tls);
    let listener = server.bind().await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(server.serve(listener));

    // Connect and never send a ClientHello
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let mut rest = Vec::new();
    let n = timeout(Duration::from_secs(5), stream.read_to_end(&mut rest))
        .await
        .expect("server kept the stalled handshake open")
        .unwrap();
    assert_eq!(n, 0);
}
