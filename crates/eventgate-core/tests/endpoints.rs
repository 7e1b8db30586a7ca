//! Several endpoints driven by one reactor.

use std::io::Write;
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::time::Duration;

use eventgate_config::EndpointConfig;
use eventgate_core::endpoint::{DatagramEndpoint, Endpoint, EndpointState, StreamEndpoint};
use eventgate_core::reactor::Reactor;
use eventgate_core::socket::SocketError;
use eventgate_core::EndpointError;
use eventgate_test_utils::{FlakySink, RecordingSink, RejectingSink, SocketDir, send_datagram};
use pretty_assertions::assert_eq;

/// Turn the reactor until `done` holds.
async fn turn_until(reactor: &Reactor, done: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !done() {
            reactor.turn().await;
        }
    })
    .await
    .expect("condition not reached");
}

fn datagram_config(dir: &SocketDir, name: &str) -> EndpointConfig {
    EndpointConfig::datagram(name, &dir.path_str(&format!("{name}.sock")))
}

#[test_log::test(tokio::test)]
async fn overloaded_endpoint_does_not_stall_others() {
    let dir = SocketDir::new();
    let reactor = Reactor::new(16);
    let rejecting = Arc::new(RejectingSink::new());
    let recording = Arc::new(RecordingSink::new());

    let mut config = datagram_config(&dir, "hot");
    config.push_retries = 2;
    let mut hot = DatagramEndpoint::new(config, reactor.handle(), rejecting.clone());
    let mut calm =
        DatagramEndpoint::new(datagram_config(&dir, "calm"), reactor.handle(), recording.clone());
    for endpoint in [&mut hot, &mut calm] {
        endpoint.configure().unwrap();
        endpoint.run().unwrap();
    }

    send_datagram(hot.path(), b"doomed");
    send_datagram(calm.path(), b"one");
    send_datagram(calm.path(), b"two");

    let hot_monitor = Arc::clone(hot.monitor());
    turn_until(&reactor, || {
        recording.len() == 2 && hot_monitor.counters().datagrams == 1
    })
    .await;

    let counters = hot.monitor().counters();
    assert_eq!(counters.events_dropped, 1);
    assert_eq!(counters.events_accepted, 0);
    // One attempt plus two retries, then a single drop.
    assert_eq!(rejecting.attempts(), 3);

    assert_eq!(recording.payloads(), vec![b"one".to_vec(), b"two".to_vec()]);
    assert_eq!(hot.state(), EndpointState::Running);
    assert_eq!(calm.state(), EndpointState::Running);
}

#[test_log::test(tokio::test)]
async fn retries_absorb_a_brief_full_queue() {
    let dir = SocketDir::new();
    let reactor = Reactor::new(16);
    let sink = Arc::new(FlakySink::new(2));

    let mut config = datagram_config(&dir, "q");
    config.push_retries = 3;
    let mut endpoint = DatagramEndpoint::new(config, reactor.handle(), sink.clone());
    endpoint.configure().unwrap();
    endpoint.run().unwrap();

    send_datagram(endpoint.path(), b"survivor");
    turn_until(&reactor, || !sink.payloads().is_empty()).await;

    assert_eq!(sink.payloads(), vec![b"survivor".to_vec()]);
    assert_eq!(sink.attempts(), 3);
    assert_eq!(endpoint.monitor().counters().events_dropped, 0);
}

#[test_log::test(tokio::test)]
async fn configure_close_configure_reuses_path() {
    let dir = SocketDir::new();
    let reactor = Reactor::new(16);
    let sink = Arc::new(RecordingSink::new());
    let mut endpoint =
        DatagramEndpoint::new(datagram_config(&dir, "q"), reactor.handle(), sink.clone());
    let path = endpoint.path().to_path_buf();

    for round in 0..3u8 {
        endpoint.configure().unwrap();
        endpoint.run().unwrap();
        send_datagram(&path, &[round]);
        turn_until(&reactor, || sink.len() == usize::from(round) + 1).await;

        endpoint.close();
        assert_eq!(endpoint.state(), EndpointState::Closed);
        assert!(!path.exists());
        assert!(reactor.is_empty());
    }
    assert_eq!(sink.payloads(), vec![vec![0], vec![1], vec![2]]);
}

#[test_log::test(tokio::test)]
async fn second_endpoint_on_live_path_is_refused() {
    let dir = SocketDir::new();
    let reactor = Reactor::new(16);
    let sink = Arc::new(RecordingSink::new());
    let config = datagram_config(&dir, "shared");

    let mut first = DatagramEndpoint::new(config.clone(), reactor.handle(), sink.clone());
    first.configure().unwrap();
    first.run().unwrap();

    let mut second = DatagramEndpoint::new(config, reactor.handle(), sink.clone());
    let err = second.configure().unwrap_err();
    assert!(matches!(
        err,
        EndpointError::Socket {
            source: SocketError::InUse(_),
            ..
        }
    ));
    assert_eq!(second.state(), EndpointState::Failed);

    // The refused endpoint left the live socket alone.
    send_datagram(first.path(), b"still here");
    turn_until(&reactor, || sink.len() == 1).await;
    assert_eq!(first.state(), EndpointState::Running);
}

#[test_log::test(tokio::test)]
async fn delimited_datagram_truncation_flags_last_segment() {
    let dir = SocketDir::new();
    let reactor = Reactor::new(16);
    let sink = Arc::new(RecordingSink::new());

    let mut config = datagram_config(&dir, "q");
    config.max_message_size = 1024;
    config.framing = "delimited".to_string();
    config.delimiter = Some("\n".to_string());
    let mut endpoint = DatagramEndpoint::new(config, reactor.handle(), sink.clone());
    endpoint.configure().unwrap();
    endpoint.run().unwrap();

    let mut payload = b"head\n".to_vec();
    payload.extend(std::iter::repeat_n(b'x', 1995));
    assert_eq!(payload.len(), 2000);
    send_datagram(endpoint.path(), &payload);
    turn_until(&reactor, || sink.len() == 2).await;

    let events = sink.events();
    assert_eq!(events[0].payload, b"head");
    assert!(!events[0].provenance.truncated);
    assert_eq!(events[1].payload.len(), 1024 - 5);
    assert!(events[1].provenance.truncated);
    assert_eq!(events[1].provenance.segment, 1);
    assert_eq!(events[1].provenance.segments, 2);
}

#[test_log::test(tokio::test)]
async fn cut_on_a_delimiter_flags_no_whole_segment() {
    let dir = SocketDir::new();
    let reactor = Reactor::new(16);
    let sink = Arc::new(RecordingSink::new());

    let mut config = datagram_config(&dir, "q");
    config.max_message_size = 5;
    config.framing = "delimited".to_string();
    config.delimiter = Some("\n".to_string());
    let mut endpoint = DatagramEndpoint::new(config, reactor.handle(), sink.clone());
    endpoint.configure().unwrap();
    endpoint.run().unwrap();

    send_datagram(endpoint.path(), b"head\nyyyy");
    send_datagram(endpoint.path(), b"next");
    turn_until(&reactor, || sink.len() == 2).await;

    let events = sink.events();
    assert_eq!(events[0].payload, b"head");
    assert!(!events[0].provenance.truncated);
    assert_eq!(events[0].provenance.segments, 1);
    assert_eq!(events[1].payload, b"next");
    // The lost tail is still counted against the datagram.
    assert_eq!(endpoint.monitor().counters().truncated, 1);
}

#[test_log::test(tokio::test)]
async fn datagram_and_stream_share_a_reactor() {
    let dir = SocketDir::new();
    let reactor = Reactor::new(1);
    let sink = Arc::new(RecordingSink::new());

    let mut datagram =
        DatagramEndpoint::new(datagram_config(&dir, "dgram"), reactor.handle(), sink.clone());
    let mut stream = StreamEndpoint::new(
        EndpointConfig::stream("stream", &dir.path_str("stream.sock")),
        reactor.handle(),
        sink.clone(),
    );
    datagram.configure().unwrap();
    stream.configure().unwrap();
    datagram.run().unwrap();
    stream.run().unwrap();

    let mut client = UnixStream::connect(stream.path()).unwrap();
    client.write_all(b"over-stream\n").unwrap();
    send_datagram(datagram.path(), b"over-datagram");

    turn_until(&reactor, || sink.len() == 2).await;
    let mut payloads = sink.payloads();
    payloads.sort();
    assert_eq!(
        payloads,
        vec![b"over-datagram".to_vec(), b"over-stream".to_vec()]
    );

    datagram.close();
    stream.close();
    assert!(reactor.is_empty());
    assert!(!dir.path("dgram.sock").exists());
    assert!(!dir.path("stream.sock").exists());
}
