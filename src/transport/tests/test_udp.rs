use super::{create_test_request, wait_for_message};
use crate::{
    message::{KEEPALIVE_REQUEST, KEEPALIVE_RESPONSE},
    transport::{udp::REBIND_ATTEMPTS, TransportEvent, UdpTransport},
    Result,
};
use std::time::Duration;
use tokio::{
    net::UdpSocket,
    sync::mpsc::unbounded_channel,
    time::{sleep, timeout},
};
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn test_udp_keepalive_pong() -> Result<()> {
    let cancel_token = CancellationToken::new();
    let alice = UdpTransport::bind("127.0.0.1:0".parse()?, cancel_token.clone()).await?;
    let (alice_tx, mut alice_rx) = unbounded_channel();
    alice.start(alice_tx);

    let bob = UdpSocket::bind("127.0.0.1:0").await?;
    bob.send_to(KEEPALIVE_REQUEST, alice.local_addr()).await?;

    let mut buf = [0u8; 64];
    let (n, from) = timeout(Duration::from_secs(1), bob.recv_from(&mut buf))
        .await
        .expect("pong in time")?;
    assert_eq!(&buf[..n], KEEPALIVE_RESPONSE);
    assert_eq!(from, alice.local_addr());

    // no second reply and nothing reported upward
    let extra = timeout(Duration::from_millis(200), bob.recv_from(&mut buf)).await;
    assert!(extra.is_err());
    assert!(alice_rx.try_recv().is_err());

    cancel_token.cancel();
    Ok(())
}

#[tokio::test]
async fn test_udp_drops_noise_and_pongs() -> Result<()> {
    let cancel_token = CancellationToken::new();
    let alice = UdpTransport::bind("127.0.0.1:0".parse()?, cancel_token.clone()).await?;
    let (alice_tx, mut alice_rx) = unbounded_channel();
    alice.start(alice_tx);

    let bob = UdpSocket::bind("127.0.0.1:0").await?;
    bob.send_to(KEEPALIVE_RESPONSE, alice.local_addr()).await?;
    bob.send_to(b"hello", alice.local_addr()).await?;
    bob.send_to(b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n", alice.local_addr())
        .await?;
    let msg = create_test_request("udp-after-noise", "UDP 127.0.0.1:5060");
    bob.send_to(msg.to_string().as_bytes(), alice.local_addr())
        .await?;

    let received = wait_for_message(&mut alice_rx).await?;
    assert_eq!(received.to_string(), msg.to_string());
    cancel_token.cancel();
    Ok(())
}

#[tokio::test]
async fn test_udp_send_and_receive() -> Result<()> {
    let cancel_token = CancellationToken::new();
    let alice = UdpTransport::bind("127.0.0.1:0".parse()?, cancel_token.clone()).await?;
    let bob = UdpTransport::bind("127.0.0.1:0".parse()?, cancel_token.clone()).await?;
    let (alice_tx, _alice_rx) = unbounded_channel();
    let (bob_tx, mut bob_rx) = unbounded_channel();
    alice.start(alice_tx);
    bob.start(bob_tx);

    let msg = create_test_request("udp-round-trip", "UDP 127.0.0.1:5060");
    let id = alice.send(&msg, bob.local_addr(), None).await?;
    assert_eq!(id.remote, bob.local_addr());
    assert_eq!(id.transport, rsip::Transport::Udp);

    match super::wait_for_event(&mut bob_rx).await? {
        crate::transport::TransportEvent::Incoming(incoming) => {
            assert!(incoming.is_request());
            assert_eq!(incoming.source, alice.local_addr());
            assert_eq!(incoming.connection_id.remote, alice.local_addr());
            assert_eq!(incoming.transport, rsip::Transport::Udp);
        }
        other => panic!("unexpected event {:?}", other),
    }
    cancel_token.cancel();
    Ok(())
}

#[tokio::test]
async fn test_udp_rebind_keeps_address() -> Result<()> {
    let cancel_token = CancellationToken::new();
    let alice = UdpTransport::bind("127.0.0.1:0".parse()?, cancel_token.clone()).await?;
    let addr = alice.local_addr();
    alice.rebind().await?;
    assert_eq!(alice.local_addr(), addr);
    assert!(!alice.is_down());

    let (alice_tx, mut alice_rx) = unbounded_channel();
    alice.start(alice_tx);
    let bob = UdpSocket::bind("127.0.0.1:0").await?;
    let msg = create_test_request("udp-rebound", "UDP 127.0.0.1:5060");
    bob.send_to(msg.to_string().as_bytes(), addr).await?;
    wait_for_message(&mut alice_rx).await?;

    cancel_token.cancel();
    Ok(())
}

#[tokio::test]
async fn test_udp_send_after_halt_fails() -> Result<()> {
    let alice = UdpTransport::bind("127.0.0.1:0".parse()?, CancellationToken::new()).await?;
    alice.halt();
    let result = alice
        .send_raw(KEEPALIVE_REQUEST, "127.0.0.1:5060".parse()?, None)
        .await;
    assert!(result.is_err());
    Ok(())
}

#[tokio::test]
async fn test_udp_ttl_does_not_stick() -> Result<()> {
    let cancel_token = CancellationToken::new();
    let alice = UdpTransport::bind("127.0.0.1:0".parse()?, cancel_token.clone()).await?;
    let socket = alice.socket()?;
    let unicast_ttl = socket.ttl()?;
    let multicast_ttl = socket.multicast_ttl_v4()?;

    let bob = UdpSocket::bind("127.0.0.1:0").await?;
    alice
        .send_raw(KEEPALIVE_REQUEST, bob.local_addr()?, Some(1))
        .await?;
    assert_eq!(socket.ttl()?, unicast_ttl);

    // the route may be missing; the TTL is restored either way
    alice
        .send_raw(KEEPALIVE_REQUEST, "239.255.255.250:5060".parse()?, Some(1))
        .await
        .ok();
    assert_eq!(socket.multicast_ttl_v4()?, multicast_ttl);
    assert_eq!(socket.ttl()?, unicast_ttl);

    let mut buf = [0u8; 16];
    let (n, _) = timeout(Duration::from_secs(1), bob.recv_from(&mut buf))
        .await
        .expect("datagram in time")?;
    assert_eq!(&buf[..n], KEEPALIVE_REQUEST);
    cancel_token.cancel();
    Ok(())
}

#[tokio::test]
async fn test_udp_heals_after_receive_failure() -> Result<()> {
    let cancel_token = CancellationToken::new();
    let alice = UdpTransport::bind("127.0.0.1:0".parse()?, cancel_token.clone()).await?;
    let addr = alice.local_addr();
    let (alice_tx, mut alice_rx) = unbounded_channel();
    alice.start(alice_tx);
    alice.reset();

    // keep sending until the rebound socket picks it up
    let bob = UdpSocket::bind("127.0.0.1:0").await?;
    let msg = create_test_request("udp-healed", "UDP 127.0.0.1:5060");
    let received = timeout(Duration::from_secs(5), async {
        loop {
            bob.send_to(msg.to_string().as_bytes(), addr).await.ok();
            if let Ok(Some(event)) = timeout(Duration::from_millis(100), alice_rx.recv()).await {
                return event;
            }
        }
    })
    .await
    .expect("delivery after rebind");
    assert!(matches!(received, TransportEvent::Incoming(_)));
    assert_eq!(alice.local_addr(), addr);
    assert!(!alice.is_down());
    cancel_token.cancel();
    Ok(())
}

#[tokio::test]
async fn test_udp_down_after_rebind_attempts() -> Result<()> {
    let cancel_token = CancellationToken::new();
    let alice = UdpTransport::bind("127.0.0.1:0".parse()?, cancel_token.clone()).await?;
    let addr = alice.local_addr();
    let (alice_tx, _alice_rx) = unbounded_channel();
    alice.start(alice_tx);
    alice.reset();

    // take the port while the transport waits out its backoff
    let mut blocker = None;
    for _ in 0..40 {
        if let Ok(socket) = UdpSocket::bind(addr).await {
            blocker = Some(socket);
            break;
        }
        sleep(Duration::from_millis(10)).await;
    }
    assert!(blocker.is_some(), "released socket could not be taken");

    let deadline = Duration::from_secs(REBIND_ATTEMPTS as u64 + 3);
    timeout(deadline, async {
        while !alice.is_down() {
            sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("transport marked down");

    let result = alice
        .send_raw(KEEPALIVE_REQUEST, "127.0.0.1:5060".parse()?, None)
        .await;
    assert!(result.is_err());
    cancel_token.cancel();
    Ok(())
}
