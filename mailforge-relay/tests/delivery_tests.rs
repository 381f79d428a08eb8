//! End-to-end delivery scenarios against a mock downstream MTA.

mod support;

use std::{sync::Arc, time::Duration};

use mailforge_common::{
    Signal,
    address::Address,
    envelope::Envelope,
    events::{Event, EventBus, SessionInfo, Verdict},
    message::{Message, Priority},
    pipeline::Relayer,
};
use mailforge_relay::{
    BounceConfig, DeliveryEngine, NullQueueStore, RelayConfig, RelayMessage, RelayQueue,
    RelayStatus, SmartHost,
};
use support::mock_server::{MockConfig, MockSmtpServer};

fn test_message(sender: &str, recipients: &[&str]) -> Arc<Message> {
    let mut envelope = Envelope::default();
    envelope.open(Address::parse(sender));
    for recipient in recipients {
        envelope
            .recipients_mut()
            .push(Address::parse(recipient).unwrap());
    }

    Arc::new(Message::new(
        envelope,
        Arc::from(b"Subject: relay test\r\n\r\nhello downstream\r\n".as_slice()),
    ))
}

fn session_info() -> SessionInfo {
    SessionInfo {
        id: ulid::Ulid::new(),
        peer: "127.0.0.1:52525".parse().unwrap(),
        started_at: std::time::SystemTime::now(),
        helo: Some("client.test".to_string()),
        tls: false,
        authenticated: None,
    }
}

fn engine_with_hosts(hosts: Vec<SmartHost>, bounce: BounceConfig) -> Arc<DeliveryEngine> {
    let config = RelayConfig {
        use_mx_routing: false,
        smart_hosts: hosts,
        connection_timeout_secs: 5,
        idle_poll_secs: 1,
        bounce,
        ..RelayConfig::default()
    };

    Arc::new(DeliveryEngine::new(
        config,
        Arc::new(NullQueueStore),
        None,
        EventBus::new(),
    ))
}

async fn wait_for_status(
    queue: &RelayQueue,
    queue_id: ulid::Ulid,
    wanted: RelayStatus,
) -> RelayMessage {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if let Some(entry) = queue.get(queue_id)
                && entry.status == wanted
            {
                return entry;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .unwrap_or_else(|_| {
        panic!(
            "entry {queue_id} never reached {wanted:?}; queue: {:?}",
            queue.get(queue_id).map(|e| e.status)
        )
    })
}

#[tokio::test]
async fn delivers_through_a_smart_host() {
    let mock = MockSmtpServer::start(MockConfig::default()).await;

    let engine = engine_with_hosts(
        vec![SmartHost::new(mock.host(), mock.port())],
        BounceConfig::default(),
    );
    let queue = engine.queue();

    let (shutdown, _keep) = tokio::sync::broadcast::channel(1);
    let runner = tokio::spawn(Arc::clone(&engine).run(shutdown.clone()));

    let message = test_message("sender@origin.example", &["rcpt@dest.example"]);
    assert!(engine.submit(&session_info(), message).await);

    let queued = queue.get_all();
    assert_eq!(queued.len(), 1);
    let entry = wait_for_status(&queue, queued[0].queue_id, RelayStatus::Delivered).await;

    assert_eq!(entry.attempts, 1);
    assert_eq!(entry.accepted_recipients, vec!["rcpt@dest.example"]);
    assert!(entry.rejected_recipients.is_empty());
    assert!(entry.smart_host.is_some());

    assert!(mock.received_command("EHLO"));
    assert!(mock.received_command("MAIL FROM:<SENDER@ORIGIN.EXAMPLE>"));
    assert!(mock.received_command("RCPT TO:<RCPT@DEST.EXAMPLE>"));
    assert!(mock.commands().contains(&"<message body>".to_string()));

    let _ = shutdown.send(Signal::Shutdown);
    let _ = runner.await;
    mock.shutdown();
}

#[tokio::test]
async fn smart_host_failover_stays_within_one_attempt() {
    // A port that refuses connections: bind, observe, drop.
    let refused_port = {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };

    let mock = MockSmtpServer::start(MockConfig::default()).await;

    let events = EventBus::new();
    let attempts: Arc<std::sync::Mutex<Vec<(String, bool)>>> =
        Arc::new(std::sync::Mutex::new(Vec::new()));
    {
        let attempts = Arc::clone(&attempts);
        events.subscribe(Arc::new(move |event: &Event| {
            if let Event::DeliveryAttempted {
                target, success, ..
            } = event
            {
                attempts.lock().unwrap().push((target.clone(), *success));
            }
            Verdict::Continue
        }));
    }

    let config = RelayConfig {
        use_mx_routing: false,
        smart_hosts: vec![
            SmartHost {
                priority: 10,
                ..SmartHost::new("127.0.0.1", refused_port)
            },
            SmartHost {
                priority: 20,
                ..SmartHost::new(mock.host(), mock.port())
            },
        ],
        connection_timeout_secs: 5,
        idle_poll_secs: 1,
        ..RelayConfig::default()
    };
    let engine = Arc::new(DeliveryEngine::new(
        config,
        Arc::new(NullQueueStore),
        None,
        events,
    ));
    let queue = engine.queue();

    let (shutdown, _keep) = tokio::sync::broadcast::channel(1);
    let runner = tokio::spawn(Arc::clone(&engine).run(shutdown.clone()));

    let message = test_message("sender@origin.example", &["rcpt@dest.example"]);
    engine.submit(&session_info(), message).await;

    let queued = queue.get_all();
    let entry = wait_for_status(&queue, queued[0].queue_id, RelayStatus::Delivered).await;

    // Fallback to the secondary happened inside the same attempt
    assert_eq!(entry.attempts, 1);

    let trace = attempts.lock().unwrap().clone();
    assert_eq!(trace.len(), 2, "expected two targets tried: {trace:?}");
    assert_eq!(trace[0], (format!("127.0.0.1:{refused_port}"), false));
    assert_eq!(trace[1], (format!("{}:{}", mock.host(), mock.port()), true));

    let _ = shutdown.send(Signal::Shutdown);
    let _ = runner.await;
    mock.shutdown();
}

#[tokio::test]
async fn transient_rejection_defers_on_the_backoff_schedule() {
    let mock = MockSmtpServer::start(MockConfig {
        rcpt_script: vec![(451, "greylisted, try again".to_string())],
        ..MockConfig::default()
    })
    .await;

    let engine = engine_with_hosts(
        vec![SmartHost::new(mock.host(), mock.port())],
        BounceConfig::default(),
    );
    let queue = engine.queue();

    let (shutdown, _keep) = tokio::sync::broadcast::channel(1);
    let runner = tokio::spawn(Arc::clone(&engine).run(shutdown.clone()));

    let message = test_message("sender@origin.example", &["rcpt@dest.example"]);
    engine.submit(&session_info(), message).await;

    let queued = queue.get_all();
    let entry = wait_for_status(&queue, queued[0].queue_id, RelayStatus::Deferred).await;

    assert_eq!(entry.attempts, 1);
    assert!(entry.last_error.as_deref().unwrap().contains("451"));

    // First deferral waits one minute, per the schedule
    let delay = entry
        .next_attempt
        .duration_since(std::time::SystemTime::now())
        .unwrap_or_default();
    assert!(
        delay > Duration::from_secs(55) && delay <= Duration::from_secs(60),
        "unexpected backoff delay {delay:?}"
    );

    let _ = shutdown.send(Signal::Shutdown);
    let _ = runner.await;
    mock.shutdown();
}

#[tokio::test]
async fn permanent_rejection_fails_and_generates_a_bounce() {
    let mock = MockSmtpServer::start(MockConfig {
        rcpt_script: vec![(550, "no such user".to_string())],
        ..MockConfig::default()
    })
    .await;

    let bounce = BounceConfig {
        enabled: true,
        sender: "MAILER-DAEMON@relay.example".to_string(),
        reporting_mta: "relay.example".to_string(),
    };
    let engine = engine_with_hosts(vec![SmartHost::new(mock.host(), mock.port())], bounce);
    let queue = engine.queue();

    let (shutdown, _keep) = tokio::sync::broadcast::channel(1);
    let runner = tokio::spawn(Arc::clone(&engine).run(shutdown.clone()));

    let message = test_message("sender@origin.example", &["gone@dest.example"]);
    engine.submit(&session_info(), message).await;

    let queued = queue.get_all();
    let entry = wait_for_status(&queue, queued[0].queue_id, RelayStatus::Failed).await;

    assert_eq!(entry.rejected_recipients.len(), 1);
    assert!(entry.rejected_recipients[0].permanent);

    // A bounce entry was queued back to the original sender at Low priority
    let bounce_entry = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(found) = queue
                .get_all()
                .into_iter()
                .find(|e| e.domain == "origin.example")
            {
                return found;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .expect("bounce entry never appeared");

    assert_eq!(bounce_entry.priority, Priority::Low);
    assert_eq!(
        bounce_entry.pending_recipients,
        vec!["sender@origin.example"]
    );
    // The bounce itself carries the null reverse-path
    assert!(bounce_entry.message.envelope().sender().is_none());

    let _ = shutdown.send(Signal::Shutdown);
    let _ = runner.await;
    mock.shutdown();
}

#[tokio::test]
async fn mixed_recipient_results_are_partial_delivery() {
    let mock = MockSmtpServer::start(MockConfig {
        rcpt_script: vec![
            (250, "Ok".to_string()),
            (550, "no such user".to_string()),
        ],
        ..MockConfig::default()
    })
    .await;

    let engine = engine_with_hosts(
        vec![SmartHost::new(mock.host(), mock.port())],
        BounceConfig::default(),
    );
    let queue = engine.queue();

    let (shutdown, _keep) = tokio::sync::broadcast::channel(1);
    let runner = tokio::spawn(Arc::clone(&engine).run(shutdown.clone()));

    let message = test_message(
        "sender@origin.example",
        &["alive@dest.example", "gone@dest.example"],
    );
    engine.submit(&session_info(), message).await;

    let queued = queue.get_all();
    let entry =
        wait_for_status(&queue, queued[0].queue_id, RelayStatus::PartiallyDelivered).await;

    assert_eq!(entry.accepted_recipients, vec!["alive@dest.example"]);
    assert_eq!(entry.rejected_recipients.len(), 1);
    assert_eq!(entry.rejected_recipients[0].recipient, "gone@dest.example");
    assert!(entry.status.is_terminal());

    // The message still went out for the accepted recipient
    assert!(mock.commands().contains(&"<message body>".to_string()));

    let _ = shutdown.send(Signal::Shutdown);
    let _ = runner.await;
    mock.shutdown();
}

#[tokio::test]
async fn local_recipients_never_enter_the_queue() {
    let config = RelayConfig {
        use_mx_routing: false,
        local_domains: vec!["local.example".to_string()],
        smart_hosts: vec![SmartHost::new("127.0.0.1", 1)],
        ..RelayConfig::default()
    };
    let engine = Arc::new(DeliveryEngine::new(
        config,
        Arc::new(NullQueueStore),
        None,
        EventBus::new(),
    ));

    let message = test_message(
        "sender@origin.example",
        &["here@local.example", "there@remote.example"],
    );
    engine.submit(&session_info(), message).await;

    let queued = engine.queue().get_all();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].domain, "remote.example");
    assert_eq!(queued[0].pending_recipients, vec!["there@remote.example"]);
}
