//! Query resolution.
//!
//! Every datagram goes through the same steps: parse, look at the first
//! question, answer address queries from the cache (or refuse blocked names),
//! and forward everything else to the upstream, learning address answers from
//! the reply on the way back.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use log::{debug, warn};

use crate::cache::{CachePort, Ttl, FIELD_A};
use crate::dns::{
    rcode, Header, Message, Question, RecordType, ResourceRecord, FIRST_QUESTION_OFFSET, TYPE_A,
};
use crate::errors::DnsError;
use crate::name::Name;
use crate::upstream::UdpForwarder;

/// Cached address that marks a name as blocked.
pub const BLOCKED_ADDR: Ipv4Addr = Ipv4Addr::UNSPECIFIED;

/// How a query was answered, with the bytes to send back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Synthesized from a cached address.
    Cached(Vec<u8>),
    /// Name error for a blocked name.
    Blocked(Vec<u8>),
    /// Upstream reply, relayed untouched.
    Forwarded(Vec<u8>),
}

impl Outcome {
    pub fn bytes(&self) -> &[u8] {
        match self {
            Outcome::Cached(b) | Outcome::Blocked(b) | Outcome::Forwarded(b) => b,
        }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            Outcome::Cached(b) | Outcome::Blocked(b) | Outcome::Forwarded(b) => b,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Outcome::Cached(_) => "cached",
            Outcome::Blocked(_) => "blocked",
            Outcome::Forwarded(_) => "forwarded",
        }
    }
}

/// The relay: a cache and an upstream, shared by every in-flight query.
pub struct DnsRelay {
    cache: Arc<dyn CachePort>,
    forwarder: UdpForwarder,
}

impl DnsRelay {
    pub fn new(cache: Arc<dyn CachePort>, forwarder: UdpForwarder) -> Self {
        Self { cache, forwarder }
    }

    /// Resolve one datagram from `src`.
    ///
    /// An error means nothing should be sent back: the query was malformed
    /// or the upstream could not be reached.
    pub async fn resolve(&self, datagram: &[u8], src: SocketAddr) -> Result<Outcome, DnsError> {
        let query = Message::parse(datagram)?;

        if let Some(question) = query.first_question() {
            debug!(
                "Query {} {} {} from {}",
                question.qname,
                question.record_class(),
                question.record_type(),
                src
            );
            if question.qtype == TYPE_A {
                let name = question.qname.as_str();
                match self.lookup(name) {
                    Some(addr) if addr == BLOCKED_ADDR => {
                        debug!("{} is blocked", question.qname);
                        return Ok(Outcome::Blocked(blocked_response(&query)?));
                    }
                    Some(addr) => {
                        let ttl = self.remaining_ttl(name);
                        debug!("Answering {} with cached {} (ttl {})", question.qname, addr, ttl);
                        return Ok(Outcome::Cached(answer_response(&query, addr, ttl)?));
                    }
                    None => {}
                }
            }
        }

        self.forward_and_learn(datagram, &query).await.map(Outcome::Forwarded)
    }

    /// Cached address for `name`; read failures count as a miss.
    fn lookup(&self, name: &str) -> Option<Ipv4Addr> {
        match self.cache.get(name, FIELD_A) {
            Ok(Some(value)) => match <[u8; 4]>::try_from(value.as_slice()) {
                Ok(octets) => Some(Ipv4Addr::from(octets)),
                Err(_) => {
                    warn!("Ignoring {}-byte cached address for {}", value.len(), name);
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!("Cache read for {} failed, forwarding: {}", name, e);
                None
            }
        }
    }

    /// TTL to put on a synthesized answer; persistent entries get 0.
    fn remaining_ttl(&self, name: &str) -> u32 {
        match self.cache.get_ttl(name) {
            Ok(Some(Ttl::Expires(secs))) => u32::try_from(secs).unwrap_or(u32::MAX),
            Ok(_) => 0,
            Err(e) => {
                warn!("Cache TTL read for {} failed: {}", name, e);
                0
            }
        }
    }

    async fn forward_and_learn(
        &self,
        datagram: &[u8],
        query: &Message,
    ) -> Result<Vec<u8>, DnsError> {
        let reply = self.forwarder.forward(datagram).await?;
        let parsed = Message::parse(&reply).map_err(|e| {
            DnsError::UpstreamUnavailable(format!(
                "malformed reply from {}: {}",
                self.forwarder.upstream(),
                e
            ))
        })?;
        debug!("Upstream reply: {}", summarize(&parsed));
        if let Some(question) = query.first_question() {
            self.learn(question.qname.as_str(), &parsed);
        }
        Ok(reply)
    }

    /// Cache the address answers of an upstream reply under the question name.
    ///
    /// Zero-TTL records are skipped, and a persistent (seeded) entry is never
    /// replaced. A write that fails halfway is rolled back so the key cannot
    /// be left behind without its expiry; failures are otherwise only logged.
    fn learn(&self, name: &str, reply: &Message) {
        let mut records = reply
            .answers
            .iter()
            .filter(|r| r.ttl > 0)
            .filter_map(|r| r.ipv4().map(|addr| (addr, r.ttl)))
            .peekable();
        if records.peek().is_none() {
            return;
        }
        if matches!(self.cache.get_ttl(name), Ok(Some(Ttl::Persistent))) {
            debug!("Keeping static entry for {}", name);
            return;
        }
        for (addr, ttl) in records {
            let stored = self
                .cache
                .put(name, FIELD_A, &addr.octets())
                .and_then(|_| self.cache.set_ttl(name, Ttl::Expires(u64::from(ttl))));
            match stored {
                Ok(()) => debug!("Cached {} -> {} for {}s", name, addr, ttl),
                Err(e) => {
                    warn!("Failed to cache {} -> {}: {}", name, addr, e);
                    if let Err(e) = self.cache.delete_key(name) {
                        warn!("Could not roll back {}: {}", name, e);
                    }
                    return;
                }
            }
        }
    }
}

fn response_header(query: &Header, rcode: u8) -> Header {
    Header {
        id: query.id,
        qr: true,
        opcode: query.opcode,
        rd: query.rd,
        ra: true,
        rcode,
        ..Header::default()
    }
}

/// The query's first question in uncompressed form, so it can sit at
/// offset 12 of a response.
fn echoed_question(query: &Message) -> Result<Question, DnsError> {
    let question = query
        .first_question()
        .ok_or_else(|| DnsError::format("query has no question"))?;
    Ok(Question::new(
        Name::from_text(question.qname.as_str())?,
        question.qtype,
        question.qclass,
    ))
}

/// Response carrying one address record for the query's first question.
///
/// The answer's name is a pointer to the echoed question at offset 12.
pub fn answer_response(query: &Message, addr: Ipv4Addr, ttl: u32) -> Result<Vec<u8>, DnsError> {
    let question = echoed_question(query)?;
    let owner = Name::pointer(FIRST_QUESTION_OFFSET, question.qname.as_str());
    let response = Message {
        header: response_header(&query.header, rcode::NO_ERROR),
        questions: vec![question],
        answers: vec![ResourceRecord::a(owner, ttl, addr)],
        ..Message::default()
    };
    response.serialize()
}

/// Name error response for a blocked name.
pub fn blocked_response(query: &Message) -> Result<Vec<u8>, DnsError> {
    let response = Message {
        header: response_header(&query.header, rcode::NAME_ERROR),
        questions: vec![echoed_question(query)?],
        ..Message::default()
    };
    response.serialize()
}

impl std::fmt::Debug for DnsRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DnsRelay")
            .field("forwarder", &self.forwarder)
            .finish_non_exhaustive()
    }
}

/// Short description of a message for log lines.
pub fn summarize(msg: &Message) -> String {
    let question = msg
        .first_question()
        .map(|q| format!("{} {}", q.qname, RecordType::from(q.qtype)))
        .unwrap_or_else(|| "-".into());
    format!(
        "id={} rcode={} question={} answers={}",
        msg.header.id,
        msg.header.rcode,
        question,
        msg.answers.len()
    )
}
