use rsip::SipMessage;
use rsipstack_transport::{
    identifier::{MethodId, TransactionId},
    message::{self, IncomingMessage, OutgoingMessage},
    ChannelListener, KeepAlive, Provider, ProviderBuilder, Result,
};
use std::{net::SocketAddr, time::Duration};
use tokio::{net::UdpSocket, sync::mpsc::UnboundedReceiver, time::timeout};

fn init_logging() {
    tracing_subscriber::fmt()
        .with_file(true)
        .with_line_number(true)
        .try_init()
        .ok();
}

async fn next_message(receiver: &mut UnboundedReceiver<IncomingMessage>) -> IncomingMessage {
    timeout(Duration::from_secs(2), receiver.recv())
        .await
        .expect("message in time")
        .expect("listener channel open")
}

fn options(target: &str, call_id: &str) -> SipMessage {
    SipMessage::try_from(
        format!(
            "OPTIONS {target} SIP/2.0\r\n\
             Max-Forwards: 70\r\n\
             From: <sip:alice@example.com>;tag=alice1\r\n\
             To: <sip:bob@example.com>\r\n\
             Call-ID: {call_id}\r\n\
             CSeq: 1 OPTIONS\r\n\
             Content-Length: 0\r\n\r\n"
        )
        .as_str(),
    )
    .expect("request")
}

/// 200 OK echoing the request's Via, From, To, Call-ID and CSeq.
fn ok_for(request: &SipMessage) -> SipMessage {
    let copied: Vec<String> = message::headers(request)
        .iter()
        .map(|h| h.to_string())
        .filter(|h| {
            let name = h.split(':').next().unwrap_or_default().to_ascii_lowercase();
            matches!(name.as_str(), "via" | "from" | "call-id" | "cseq")
        })
        .collect();
    let to = message::headers(request)
        .iter()
        .map(|h| h.to_string())
        .find(|h| h.to_ascii_lowercase().starts_with("to:"))
        .expect("To header");
    SipMessage::try_from(
        format!(
            "SIP/2.0 200 OK\r\n{}\r\n{};tag=bob1\r\nContent-Length: 0\r\n\r\n",
            copied.join("\r\n"),
            to
        )
        .as_str(),
    )
    .expect("response")
}

async fn provider_with(udp: bool, tcp: bool) -> Result<Provider> {
    let mut builder = ProviderBuilder::new();
    builder.with_via_addr("127.0.0.1", None);
    if udp {
        builder.with_udp("127.0.0.1:0".parse()?);
    }
    if tcp {
        builder.with_tcp("127.0.0.1:0".parse()?);
    }
    builder.build().await
}

#[tokio::test]
async fn test_request_arrives_with_one_via() -> Result<()> {
    init_logging();
    let alice = provider_with(true, false).await?;
    let bob = provider_with(true, false).await?;
    let (listener, mut inbox) = ChannelListener::new();
    bob.add_selective_listener(MethodId::Any, listener)?;

    let bob_addr = bob.local_addr(&rsip::Transport::Udp).expect("bob udp");
    let alice_addr = alice.local_addr(&rsip::Transport::Udp).expect("alice udp");
    let sent = alice
        .send(&mut options(&format!("sip:bob@{}", bob_addr), "via-1").into())
        .await;
    assert!(sent.is_some());

    let received = next_message(&mut inbox).await;
    assert_eq!(received.source, alice_addr);
    assert_eq!(message::via_count(&received.message), 1);
    let via = message::top_via(&received.message).expect("via")?;
    assert_eq!(via.sent_by(), format!("127.0.0.1:{}", alice_addr.port()));
    // the sender is where it claims to be, so nothing is stamped
    assert_eq!(via.received(), None);

    alice.halt();
    bob.halt();
    Ok(())
}

#[tokio::test]
async fn test_udp_request_and_response() -> Result<()> {
    init_logging();
    let alice = provider_with(true, false).await?;
    let bob = provider_with(true, false).await?;
    let (alice_listener, mut alice_inbox) = ChannelListener::new();
    let (bob_listener, mut bob_inbox) = ChannelListener::new();
    bob.add_selective_listener(MethodId::Any, bob_listener)?;

    let bob_addr = bob.local_addr(&rsip::Transport::Udp).expect("bob udp");
    let mut sent = OutgoingMessage::new(options(&format!("sip:bob@{}", bob_addr), "udp-rr-1"));
    alice.try_send(&mut sent).await?;
    // the Via went onto the caller's copy, so its transaction can be awaited
    let branch = message::top_via(&sent.message).expect("via")?;
    assert!(branch.branch().is_some());
    alice.add_selective_listener(TransactionId::client(&sent.message)?, alice_listener)?;

    let request = next_message(&mut bob_inbox).await;
    assert_eq!(
        message::top_via(&request.message).expect("via")?.branch(),
        branch.branch()
    );
    bob.try_send(&mut ok_for(&request.message).into()).await?;

    let response = next_message(&mut alice_inbox).await;
    assert!(!response.is_request());
    assert_eq!(response.source, bob_addr);
    alice.halt();
    bob.halt();
    Ok(())
}

#[tokio::test]
async fn test_tcp_response_on_pinned_connection() -> Result<()> {
    init_logging();
    let alice = provider_with(false, true).await?;
    let bob = provider_with(false, true).await?;
    let (alice_listener, mut alice_inbox) = ChannelListener::new();
    let (bob_listener, mut bob_inbox) = ChannelListener::new();
    alice.add_selective_listener(MethodId::Any, alice_listener)?;
    bob.add_selective_listener(MethodId::Any, bob_listener)?;

    let bob_addr = bob.local_addr(&rsip::Transport::Tcp).expect("bob tcp");
    let target = format!("sip:bob@{};transport=tcp", bob_addr);
    let first = alice.try_send(&mut options(&target, "tcp-1").into()).await?;
    let request = next_message(&mut bob_inbox).await;
    assert_eq!(request.transport, rsip::Transport::Tcp);
    let via = message::top_via(&request.message).expect("via")?;
    assert_eq!(via.transport(), rsip::Transport::Tcp);

    let mut response =
        OutgoingMessage::new(ok_for(&request.message)).pinned(request.connection_id);
    bob.try_send(&mut response).await?;
    let answered = next_message(&mut alice_inbox).await;
    assert!(!answered.is_request());

    // a second request reuses the pooled connection
    let second = alice.try_send(&mut options(&target, "tcp-2").into()).await?;
    assert_eq!(first, second);
    next_message(&mut bob_inbox).await;
    assert_eq!(alice.connections(), vec![first]);
    assert_eq!(bob.connections().len(), 1);

    alice.halt();
    bob.halt();
    Ok(())
}

#[tokio::test]
async fn test_keepalive_until_halted() -> Result<()> {
    init_logging();
    let alice = provider_with(true, false).await?;
    let peer = UdpSocket::bind("127.0.0.1:0").await?;
    let peer_addr: SocketAddr = peer.local_addr()?;

    let handle = KeepAlive::new(
        alice.clone(),
        rsip::Transport::Udp,
        peer_addr,
        Duration::from_millis(50),
    )
    .start();

    let mut buf = [0u8; 64];
    for _ in 0..2 {
        let (n, _) = timeout(Duration::from_secs(1), peer.recv_from(&mut buf))
            .await
            .expect("keep-alive in time")?;
        assert_eq!(&buf[..n], b"\r\n\r\n");
    }

    handle.halt();
    assert!(handle.is_halted());
    // drain anything already in flight, then expect silence
    tokio::time::sleep(Duration::from_millis(100)).await;
    while timeout(Duration::from_millis(10), peer.recv_from(&mut buf)).await.is_ok() {}
    let silent = timeout(Duration::from_millis(200), peer.recv_from(&mut buf)).await;
    assert!(silent.is_err());

    alice.halt();
    Ok(())
}
