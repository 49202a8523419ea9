use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::timeout;

use nx9_dns_relay::cache::{CachePort, MemoryCache, Ttl, FIELD_A};
use nx9_dns_relay::dns::{
    rcode, Message, RecordType, ResourceRecord, CLASS_IN, FIRST_QUESTION_OFFSET, TYPE_A,
};
use nx9_dns_relay::handlers::serve_udp;
use nx9_dns_relay::name::Name;
use nx9_dns_relay::seed::load_seed;
use nx9_dns_relay::{DnsError, DnsRelay, Outcome, SqliteCache, UdpForwarder};

/// A UDP "resolver" on localhost that reports every datagram it receives
/// and answers with whatever `respond` returns, after the given delay.
async fn fake_upstream<F>(respond: F) -> (SocketAddr, mpsc::UnboundedReceiver<Vec<u8>>)
where
    F: Fn(&[u8]) -> Option<(Vec<u8>, Duration)> + Send + 'static,
{
    let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
    let addr = socket.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let mut buf = vec![0u8; 4096];
        loop {
            let Ok((size, from)) = socket.recv_from(&mut buf).await else {
                return;
            };
            let query = buf[..size].to_vec();
            let _ = tx.send(query.clone());
            if let Some((reply, delay)) = respond(&query) {
                let socket = socket.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = socket.send_to(&reply, from).await;
                });
            }
        }
    });
    (addr, rx)
}

/// Upstream answer for the query's name: a CNAME-free A record.
fn a_reply(query: &[u8], ttl: u32, addr: Ipv4Addr) -> Vec<u8> {
    let mut msg = Message::parse(query).unwrap();
    msg.header.qr = true;
    msg.header.ra = true;
    let owner = Name::pointer(FIRST_QUESTION_OFFSET, msg.questions[0].qname.as_str());
    msg.answers.push(ResourceRecord::a(owner, ttl, addr));
    msg.serialize().unwrap()
}

fn query_bytes(id: u16, name: &str, qtype: u16) -> Vec<u8> {
    Message::query(id, name, qtype).unwrap().serialize().unwrap()
}

fn client() -> SocketAddr {
    "127.0.0.1:53000".parse().unwrap()
}

fn make_relay(cache: Arc<dyn CachePort>, upstream: SocketAddr) -> DnsRelay {
    DnsRelay::new(
        cache,
        UdpForwarder::new(upstream).with_timeout(Duration::from_secs(2)),
    )
}

/// An upstream that must never be contacted.
async fn unused_upstream() -> (SocketAddr, mpsc::UnboundedReceiver<Vec<u8>>) {
    fake_upstream(|_| None).await
}

async fn assert_nothing_forwarded(rx: &mut mpsc::UnboundedReceiver<Vec<u8>>) {
    let got = timeout(Duration::from_millis(150), rx.recv()).await;
    assert!(got.is_err(), "upstream unexpectedly received {:?}", got);
}

#[tokio::test]
async fn cached_address_is_answered_locally() {
    let cache = Arc::new(MemoryCache::new(64));
    cache.put("example.com", FIELD_A, &[1, 2, 3, 4]).unwrap();
    let (upstream, mut received) = unused_upstream().await;
    let relay = make_relay(cache, upstream);

    let outcome = relay
        .resolve(&query_bytes(0x1001, "example.com", TYPE_A), client())
        .await
        .unwrap();
    assert!(matches!(outcome, Outcome::Cached(_)));

    let response = Message::parse(outcome.bytes()).unwrap();
    assert_eq!(response.header.id, 0x1001);
    assert!(response.header.qr);
    assert_eq!(response.header.rcode, rcode::NO_ERROR);
    assert_eq!(response.header.ancount, 1);
    let answer = &response.answers[0];
    assert_eq!(answer.rtype, TYPE_A);
    assert_eq!(answer.class, CLASS_IN);
    assert_eq!(answer.rdata, vec![1, 2, 3, 4]);
    assert_eq!(answer.name.wire(), &[0xC0, 0x0C]);

    assert_nothing_forwarded(&mut received).await;
}

#[tokio::test]
async fn sinkholed_name_is_nxdomain() {
    let cache = Arc::new(MemoryCache::new(64));
    load_seed("0.0.0.0 blocked.test", cache.as_ref()).unwrap();
    let (upstream, mut received) = unused_upstream().await;
    let relay = make_relay(cache, upstream);

    let outcome = relay
        .resolve(&query_bytes(0x2002, "blocked.test", TYPE_A), client())
        .await
        .unwrap();
    assert!(matches!(outcome, Outcome::Blocked(_)));

    let response = Message::parse(outcome.bytes()).unwrap();
    assert_eq!(response.header.id, 0x2002);
    assert!(response.header.qr);
    assert_eq!(response.header.rcode, rcode::NAME_ERROR);
    assert_eq!(response.header.ancount, 0);

    assert_nothing_forwarded(&mut received).await;
}

#[tokio::test]
async fn miss_is_forwarded_verbatim_and_learned() {
    let cache = Arc::new(MemoryCache::new(64));
    let (upstream, mut received) = fake_upstream(|q| {
        Some((a_reply(q, 300, Ipv4Addr::new(203, 0, 113, 7)), Duration::ZERO))
    })
    .await;
    let relay = make_relay(cache.clone(), upstream);

    let query = query_bytes(0x3003, "unknown.test", TYPE_A);
    let outcome = relay.resolve(&query, client()).await.unwrap();

    let seen = received.recv().await.unwrap();
    assert_eq!(seen, query);
    assert_eq!(outcome, Outcome::Forwarded(a_reply(&query, 300, Ipv4Addr::new(203, 0, 113, 7))));

    assert_eq!(cache.get("unknown.test", FIELD_A).unwrap(), Some(vec![203, 0, 113, 7]));
    match cache.get_ttl("unknown.test").unwrap() {
        Some(Ttl::Expires(secs)) => assert!(secs > 0 && secs <= 300, "ttl {}", secs),
        other => panic!("expected an expiring entry, got {:?}", other),
    }

    // The next query is served from the cache with the remaining TTL.
    let again = relay
        .resolve(&query_bytes(0x3004, "unknown.test", TYPE_A), client())
        .await
        .unwrap();
    let response = Message::parse(again.bytes()).unwrap();
    assert!(matches!(again, Outcome::Cached(_)));
    assert!(response.answers[0].ttl > 0 && response.answers[0].ttl <= 300);
}

#[tokio::test]
async fn zero_ttl_answers_are_relayed_not_cached() {
    let cache = Arc::new(MemoryCache::new(64));
    let (upstream, _received) = fake_upstream(|q| {
        Some((a_reply(q, 0, Ipv4Addr::new(198, 51, 100, 1)), Duration::ZERO))
    })
    .await;
    let relay = make_relay(cache.clone(), upstream);

    let outcome = relay
        .resolve(&query_bytes(1, "volatile.test", TYPE_A), client())
        .await
        .unwrap();
    let response = Message::parse(outcome.bytes()).unwrap();
    assert_eq!(response.answers[0].ipv4(), Some(Ipv4Addr::new(198, 51, 100, 1)));
    assert_eq!(cache.get("volatile.test", FIELD_A).unwrap(), None);
}

#[tokio::test]
async fn non_address_queries_always_go_upstream() {
    let cache = Arc::new(MemoryCache::new(64));
    cache.put("example.com", FIELD_A, &[1, 2, 3, 4]).unwrap();
    let (upstream, mut received) = fake_upstream(|q| {
        let mut msg = Message::parse(q).unwrap();
        msg.header.qr = true;
        Some((msg.serialize().unwrap(), Duration::ZERO))
    })
    .await;
    let relay = make_relay(cache.clone(), upstream);

    let query = query_bytes(0x4004, "example.com", RecordType::AAAA.into());
    let outcome = relay.resolve(&query, client()).await.unwrap();
    assert!(matches!(outcome, Outcome::Forwarded(_)));
    assert_eq!(received.recv().await.unwrap(), query);
    assert_eq!(cache.get_ttl("example.com").unwrap(), Some(Ttl::Persistent));
}

#[tokio::test]
async fn truncated_query_is_dropped_without_side_effects() {
    let cache = Arc::new(MemoryCache::new(64));
    let (upstream, mut received) = unused_upstream().await;
    let relay = make_relay(cache.clone(), upstream);

    let mut query = query_bytes(0x5005, "short.test", TYPE_A);
    query.truncate(query.len() - 3);
    let err = relay.resolve(&query, client()).await.unwrap_err();
    assert!(matches!(err, DnsError::Format(_)));

    // ANCOUNT claims a record that is not there.
    let mut lying = query_bytes(0x5006, "short.test", TYPE_A);
    lying[7] = 1;
    assert!(relay.resolve(&lying, client()).await.is_err());

    assert!(cache.is_empty());
    assert_nothing_forwarded(&mut received).await;
}

#[tokio::test]
async fn upstream_failures_send_nothing() {
    let cache = Arc::new(MemoryCache::new(64));

    // Silent upstream.
    let (silent, _rx) = unused_upstream().await;
    let relay = DnsRelay::new(
        cache.clone(),
        UdpForwarder::new(silent).with_timeout(Duration::from_millis(100)),
    );
    let err = relay
        .resolve(&query_bytes(1, "slow.test", TYPE_A), client())
        .await
        .unwrap_err();
    assert!(matches!(err, DnsError::UpstreamUnavailable(_)));

    // Garbage reply.
    let (garbage, _rx) = fake_upstream(|_| Some((vec![0xFF; 5], Duration::ZERO))).await;
    let relay = make_relay(cache.clone(), garbage);
    let err = relay
        .resolve(&query_bytes(2, "junk.test", TYPE_A), client())
        .await
        .unwrap_err();
    assert!(matches!(err, DnsError::UpstreamUnavailable(_)));

    assert!(cache.is_empty());
}

#[tokio::test]
async fn concurrent_misses_both_get_cached() {
    let cache = Arc::new(MemoryCache::new(64));
    let (upstream, _rx) = fake_upstream(|q| {
        let name = Message::parse(q).unwrap().questions[0].qname.as_str().to_string();
        let (addr, delay) = if name == "slow.test" {
            (Ipv4Addr::new(10, 0, 0, 1), Duration::from_millis(300))
        } else {
            (Ipv4Addr::new(10, 0, 0, 2), Duration::ZERO)
        };
        Some((a_reply(q, 600, addr), delay))
    })
    .await;
    let relay = Arc::new(make_relay(cache.clone(), upstream));

    let slow = {
        let relay = relay.clone();
        tokio::spawn(async move {
            relay
                .resolve(&query_bytes(10, "slow.test", TYPE_A), client())
                .await
        })
    };
    let fast = {
        let relay = relay.clone();
        tokio::spawn(async move {
            relay
                .resolve(&query_bytes(11, "fast.test", TYPE_A), client())
                .await
        })
    };
    assert!(fast.await.unwrap().is_ok());
    assert!(slow.await.unwrap().is_ok());

    assert_eq!(cache.get("slow.test", FIELD_A).unwrap(), Some(vec![10, 0, 0, 1]));
    assert_eq!(cache.get("fast.test", FIELD_A).unwrap(), Some(vec![10, 0, 0, 2]));
}

/// A backend that is always down.
struct DownCache;

impl CachePort for DownCache {
    fn get(&self, _: &str, _: &str) -> Result<Option<Vec<u8>>, DnsError> {
        Err(DnsError::CacheUnavailable("down".into()))
    }
    fn get_all(&self, _: &str) -> Result<HashMap<String, Vec<u8>>, DnsError> {
        Err(DnsError::CacheUnavailable("down".into()))
    }
    fn put(&self, _: &str, _: &str, _: &[u8]) -> Result<(), DnsError> {
        Err(DnsError::CacheUnavailable("down".into()))
    }
    fn get_ttl(&self, _: &str) -> Result<Option<Ttl>, DnsError> {
        Err(DnsError::CacheUnavailable("down".into()))
    }
    fn set_ttl(&self, _: &str, _: Ttl) -> Result<(), DnsError> {
        Err(DnsError::CacheUnavailable("down".into()))
    }
    fn delete_key(&self, _: &str) -> Result<(), DnsError> {
        Err(DnsError::CacheUnavailable("down".into()))
    }
    fn delete_field(&self, _: &str, _: &str) -> Result<(), DnsError> {
        Err(DnsError::CacheUnavailable("down".into()))
    }
    fn purge_expired(&self) -> Result<usize, DnsError> {
        Err(DnsError::CacheUnavailable("down".into()))
    }
}

#[tokio::test]
async fn unavailable_cache_falls_through_to_upstream() {
    let (upstream, mut received) = fake_upstream(|q| {
        Some((a_reply(q, 60, Ipv4Addr::new(192, 0, 2, 1)), Duration::ZERO))
    })
    .await;
    let relay = make_relay(Arc::new(DownCache), upstream);

    let query = query_bytes(0x6006, "anything.test", TYPE_A);
    let outcome = relay.resolve(&query, client()).await.unwrap();
    assert!(matches!(outcome, Outcome::Forwarded(_)));
    assert_eq!(received.recv().await.unwrap(), query);
}

/// Memory cache whose first `set_ttl` calls fail, like a backend that
/// times out between two writes.
struct FlakyTtl {
    inner: MemoryCache,
    failures_left: AtomicUsize,
}

impl FlakyTtl {
    fn failing(times: usize) -> Self {
        Self {
            inner: MemoryCache::new(64),
            failures_left: AtomicUsize::new(times),
        }
    }
}

impl CachePort for FlakyTtl {
    fn get(&self, key: &str, field: &str) -> Result<Option<Vec<u8>>, DnsError> {
        self.inner.get(key, field)
    }
    fn get_all(&self, key: &str) -> Result<HashMap<String, Vec<u8>>, DnsError> {
        self.inner.get_all(key)
    }
    fn put(&self, key: &str, field: &str, value: &[u8]) -> Result<(), DnsError> {
        self.inner.put(key, field, value)
    }
    fn get_ttl(&self, key: &str) -> Result<Option<Ttl>, DnsError> {
        self.inner.get_ttl(key)
    }
    fn set_ttl(&self, key: &str, ttl: Ttl) -> Result<(), DnsError> {
        let fail = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            return Err(DnsError::CacheUnavailable("busy".into()));
        }
        self.inner.set_ttl(key, ttl)
    }
    fn delete_key(&self, key: &str) -> Result<(), DnsError> {
        self.inner.delete_key(key)
    }
    fn delete_field(&self, key: &str, field: &str) -> Result<(), DnsError> {
        self.inner.delete_field(key, field)
    }
    fn purge_expired(&self) -> Result<usize, DnsError> {
        self.inner.purge_expired()
    }
}

#[tokio::test]
async fn failed_expiry_write_leaves_no_static_entry() {
    let cache = Arc::new(FlakyTtl::failing(1));
    let (upstream, mut received) = fake_upstream(|q| {
        Some((a_reply(q, 300, Ipv4Addr::new(10, 0, 0, 1)), Duration::ZERO))
    })
    .await;
    let relay = make_relay(cache.clone(), upstream);

    let first = relay
        .resolve(&query_bytes(1, "flaky.test", TYPE_A), client())
        .await
        .unwrap();
    assert!(matches!(first, Outcome::Forwarded(_)));
    assert_eq!(cache.get("flaky.test", FIELD_A).unwrap(), None);
    assert_eq!(cache.get_ttl("flaky.test").unwrap(), None);

    // Not cached, so the next query goes upstream again and is learned properly.
    let second = relay
        .resolve(&query_bytes(2, "flaky.test", TYPE_A), client())
        .await
        .unwrap();
    assert!(matches!(second, Outcome::Forwarded(_)));
    assert_eq!(received.recv().await.unwrap()[..2], [0, 1]);
    assert_eq!(received.recv().await.unwrap()[..2], [0, 2]);
    assert_eq!(cache.get("flaky.test", FIELD_A).unwrap(), Some(vec![10, 0, 0, 1]));
    assert!(matches!(
        cache.get_ttl("flaky.test").unwrap(),
        Some(Ttl::Expires(s)) if s > 0 && s <= 300
    ));
}

/// A raw query whose name has a label of non-UTF-8 bytes.
fn binary_name_query(id: u16, qtype: u16) -> Vec<u8> {
    let mut buf = vec![0, 0, 0x01, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00];
    buf[..2].copy_from_slice(&id.to_be_bytes());
    buf.extend_from_slice(b"\x02\xff\xfe\x03com\x00");
    buf.extend_from_slice(&qtype.to_be_bytes());
    buf.extend_from_slice(&CLASS_IN.to_be_bytes());
    buf
}

#[tokio::test]
async fn binary_query_names_are_forwarded_and_learned() {
    let cache = Arc::new(MemoryCache::new(64));
    let (upstream, mut received) = fake_upstream(|q| {
        if Message::parse(q).unwrap().questions[0].qtype == TYPE_A {
            Some((a_reply(q, 60, Ipv4Addr::new(192, 0, 2, 9)), Duration::ZERO))
        } else {
            let mut reply = q.to_vec();
            reply[2] |= 0x80;
            Some((reply, Duration::ZERO))
        }
    })
    .await;
    let relay = make_relay(cache.clone(), upstream);

    let query = binary_name_query(0x0A0A, RecordType::AAAA.into());
    let outcome = relay.resolve(&query, client()).await.unwrap();
    assert_eq!(received.recv().await.unwrap(), query);
    let mut expected = query.clone();
    expected[2] |= 0x80;
    assert_eq!(outcome, Outcome::Forwarded(expected));

    let query = binary_name_query(0x0B0B, TYPE_A);
    relay.resolve(&query, client()).await.unwrap();
    assert_eq!(received.recv().await.unwrap(), query);
    assert_eq!(cache.get("\\255\\254.com", FIELD_A).unwrap(), Some(vec![192, 0, 2, 9]));
}

#[tokio::test]
async fn reply_with_binary_owner_is_relayed_untouched() {
    let cache = Arc::new(MemoryCache::new(64));
    let (upstream, _rx) = fake_upstream(|q| {
        let mut reply = a_reply(q, 60, Ipv4Addr::new(192, 0, 2, 10));
        // One additional TXT record owned by a name that is not UTF-8.
        reply[11] = 1;
        reply.extend_from_slice(b"\x02\xc3\x28\x00");
        reply.extend_from_slice(&[
            0x00, 0x10, 0x00, 0x01, 0x00, 0x00, 0x00, 0x3C, 0x00, 0x01, 0x00,
        ]);
        Some((reply, Duration::ZERO))
    })
    .await;
    let relay = make_relay(cache.clone(), upstream);

    let query = query_bytes(0x0C0C, "extra.test", TYPE_A);
    let bytes = match relay.resolve(&query, client()).await.unwrap() {
        Outcome::Forwarded(bytes) => bytes,
        other => panic!("expected a forwarded reply, got {:?}", other),
    };
    assert_eq!(&bytes[bytes.len() - 15..bytes.len() - 11], b"\x02\xc3\x28\x00");
    assert_eq!(Message::parse(&bytes).unwrap().additionals.len(), 1);
    assert_eq!(cache.get("extra.test", FIELD_A).unwrap(), Some(vec![192, 0, 2, 10]));
}

#[tokio::test]
async fn sqlite_backend_blocks_and_learns() {
    let cache = Arc::new(SqliteCache::in_memory().unwrap());
    load_seed("0.0.0.0 ads.test", cache.as_ref()).unwrap();
    let (upstream, _rx) = fake_upstream(|q| {
        Some((a_reply(q, 120, Ipv4Addr::new(192, 0, 2, 44)), Duration::ZERO))
    })
    .await;
    let relay = make_relay(cache.clone(), upstream);

    let blocked = relay
        .resolve(&query_bytes(1, "ads.test", TYPE_A), client())
        .await
        .unwrap();
    assert!(matches!(blocked, Outcome::Blocked(_)));

    relay
        .resolve(&query_bytes(2, "site.test", TYPE_A), client())
        .await
        .unwrap();
    assert_eq!(cache.get("site.test", FIELD_A).unwrap(), Some(vec![192, 0, 2, 44]));
    assert!(matches!(
        cache.get_ttl("site.test").unwrap(),
        Some(Ttl::Expires(s)) if s > 0 && s <= 120
    ));
}

#[tokio::test]
async fn listener_answers_over_udp() {
    let cache = Arc::new(MemoryCache::new(64));
    cache.put("served.test", FIELD_A, &[127, 0, 0, 42]).unwrap();
    let (upstream, _rx) = unused_upstream().await;
    let relay = Arc::new(make_relay(cache, upstream));

    let server = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
    let server_addr = server.local_addr().unwrap();
    let listener = tokio::spawn(serve_udp(server, relay, 512, 16));

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    // Garbage first: the listener must drop it and keep serving.
    client.send_to(&[0xAA; 5], server_addr).await.unwrap();
    client
        .send_to(&query_bytes(0x7007, "served.test", TYPE_A), server_addr)
        .await
        .unwrap();

    let mut buf = [0u8; 512];
    let (size, _) = timeout(Duration::from_secs(2), client.recv_from(&mut buf))
        .await
        .expect("no response from listener")
        .unwrap();
    let response = Message::parse(&buf[..size]).unwrap();
    assert_eq!(response.header.id, 0x7007);
    assert_eq!(response.answers[0].ipv4(), Some(Ipv4Addr::new(127, 0, 0, 42)));

    listener.abort();
}
