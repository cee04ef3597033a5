//! REGISTER flow integration tests against a scripted registrar

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;

use magpie::domain::shared::RegistrationListener;
use magpie::infrastructure::protocols::sip::{
    RegistrationConfig, RegistrationManager, RequestFactory, SipMessage, SipTransport,
    TransactionRegistry,
};

fn header_value(text: &str, name: &str) -> String {
    let prefix = format!("{}:", name);
    text.lines()
        .find_map(|l| l.strip_prefix(&prefix))
        .map(|v| v.trim().to_string())
        .unwrap_or_default()
}

fn reply(request: &str, status_line: &str, to_tag: Option<&str>, extra: &[&str]) -> String {
    let mut to = header_value(request, "To");
    if let Some(tag) = to_tag {
        to = format!("{};tag={}", to, tag);
    }
    let mut text = format!("SIP/2.0 {}\r\n", status_line);
    text.push_str(&format!("Via: {}\r\n", header_value(request, "Via")));
    text.push_str(&format!("From: {}\r\n", header_value(request, "From")));
    text.push_str(&format!("To: {}\r\n", to));
    text.push_str(&format!("Call-ID: {}\r\n", header_value(request, "Call-ID")));
    text.push_str(&format!("CSeq: {}\r\n", header_value(request, "CSeq")));
    for line in extra {
        text.push_str(line);
        text.push_str("\r\n");
    }
    text.push_str("Content-Length: 0\r\n\r\n");
    text
}

async fn recv_text(socket: &UdpSocket) -> (String, SocketAddr) {
    let mut buf = vec![0u8; 65535];
    let (n, from) = tokio::time::timeout(Duration::from_secs(5), socket.recv_from(&mut buf))
        .await
        .expect("timed out waiting for a request")
        .expect("recv failed");
    (String::from_utf8_lossy(&buf[..n]).to_string(), from)
}

async fn setup(
    registrar: SocketAddr,
) -> (Arc<RegistrationManager>, Arc<TransactionRegistry>) {
    let bind: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let (transport, mut rx) = SipTransport::bind(bind, registrar).await.unwrap();
    let registry = Arc::new(TransactionRegistry::new());

    let dispatch_registry = registry.clone();
    tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if let SipMessage::Response(response) = message {
                dispatch_registry.dispatch(&response);
            }
        }
    });

    let factory = RequestFactory {
        via_address: transport.via_address(),
        transport: "UDP".to_string(),
        contact_uri: format!("sip:alice@{}", transport.via_address()),
        feature_tags: vec!["+g.oma.sip-im".to_string()],
        instance_id: "11112222-3333-4444-5555-666677778888".to_string(),
        user_agent: "magpie-test".to_string(),
    };

    let manager = Arc::new(RegistrationManager::new(
        RegistrationConfig {
            public_user_id: "sip:alice@ims.example.com".to_string(),
            domain: "ims.example.com".to_string(),
            auth_username: "alice".to_string(),
            auth_password: "secret".to_string(),
            expire_period: 600,
            transaction_timeout: Duration::from_secs(5),
        },
        transport,
        registry.clone(),
        factory,
    ));
    (manager, registry)
}

struct CountingListener {
    registered: AtomicUsize,
    failed: AtomicUsize,
}

impl RegistrationListener for CountingListener {
    fn on_registered(&self) {
        self.registered.fetch_add(1, Ordering::SeqCst);
    }

    fn on_registration_failed(&self, _reason: &str) {
        self.failed.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn test_register_with_challenge_and_min_expires() {
    let registrar = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let registrar_addr = registrar.local_addr().unwrap();
    let (manager, _registry) = setup(registrar_addr).await;

    let listener = Arc::new(CountingListener {
        registered: AtomicUsize::new(0),
        failed: AtomicUsize::new(0),
    });
    manager.add_listener(listener.clone());

    let scripted = tokio::spawn(async move {
        // First REGISTER is challenged
        let (first, from) = recv_text(&registrar).await;
        assert!(first.starts_with("REGISTER sip:ims.example.com"));
        assert_eq!(header_value(&first, "Expires"), "600");
        assert!(!first.contains("Authorization:"));
        let challenge = reply(
            &first,
            "401 Unauthorized",
            None,
            &[r#"WWW-Authenticate: Digest realm="ims.example.com", nonce="abcdef0123", algorithm=MD5, qop="auth""#],
        );
        registrar.send_to(challenge.as_bytes(), from).await.unwrap();

        // Credentials attached, but the interval is too brief
        let (second, from) = recv_text(&registrar).await;
        let authorization = header_value(&second, "Authorization");
        assert!(authorization.starts_with("Digest"));
        assert!(authorization.contains(r#"username="alice""#));
        assert!(authorization.contains(r#"realm="ims.example.com""#));
        let too_brief = reply(&second, "423 Interval Too Brief", None, &["Min-Expires: 3600"]);
        registrar.send_to(too_brief.as_bytes(), from).await.unwrap();

        // Third attempt adopts the floor and succeeds
        let (third, from) = recv_text(&registrar).await;
        assert_eq!(header_value(&third, "Expires"), "3600");
        assert!(header_value(&third, "Authorization").starts_with("Digest"));
        let ok = reply(&third, "200 OK", Some("reg1"), &["Expires: 3600"]);
        registrar.send_to(ok.as_bytes(), from).await.unwrap();
    });

    assert!(manager.register().await);
    scripted.await.unwrap();

    assert!(manager.is_registered().await);
    assert_eq!(manager.effective_expire_period(), 3600);
    assert_eq!(listener.registered.load(Ordering::SeqCst), 1);
    assert_eq!(listener.failed.load(Ordering::SeqCst), 0);

    manager.stop();
}

#[tokio::test]
async fn test_register_second_challenge_is_fatal() {
    let registrar = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let registrar_addr = registrar.local_addr().unwrap();
    let (manager, _registry) = setup(registrar_addr).await;

    let listener = Arc::new(CountingListener {
        registered: AtomicUsize::new(0),
        failed: AtomicUsize::new(0),
    });
    manager.add_listener(listener.clone());

    let scripted = tokio::spawn(async move {
        for _ in 0..2 {
            let (request, from) = recv_text(&registrar).await;
            let challenge = reply(
                &request,
                "401 Unauthorized",
                None,
                &[r#"WWW-Authenticate: Digest realm="ims.example.com", nonce="ffff9999", algorithm=MD5"#],
            );
            registrar.send_to(challenge.as_bytes(), from).await.unwrap();
        }
    });

    assert!(!manager.register().await);
    scripted.await.unwrap();

    assert!(!manager.is_registered().await);
    assert_eq!(listener.registered.load(Ordering::SeqCst), 0);
    assert_eq!(listener.failed.load(Ordering::SeqCst), 1);

    manager.stop();
}

#[tokio::test]
async fn test_unregister_sends_zero_expires() {
    let registrar = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let registrar_addr = registrar.local_addr().unwrap();
    let (manager, _registry) = setup(registrar_addr).await;

    let scripted = tokio::spawn(async move {
        let (first, from) = recv_text(&registrar).await;
        let ok = reply(&first, "200 OK", Some("reg2"), &["Expires: 600"]);
        registrar.send_to(ok.as_bytes(), from).await.unwrap();

        let (second, from) = recv_text(&registrar).await;
        assert_eq!(header_value(&second, "Expires"), "0");
        let ok = reply(&second, "200 OK", Some("reg2"), &[]);
        registrar.send_to(ok.as_bytes(), from).await.unwrap();
    });

    assert!(manager.register().await);
    manager.unregister().await;
    scripted.await.unwrap();

    assert!(!manager.is_registered().await);
    manager.stop();
}
