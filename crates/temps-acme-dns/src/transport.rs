//! DNS transport
//!
//! A [`DnsTransport`] sends one message to one server. [`NetworkTransport`]
//! does it over UDP and repeats the query over TCP when the UDP answer is
//! truncated. [`DnsClient`] puts a timeout and a cancellation token around
//! every exchange and knows the recursive nameservers.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::{Name, RecordType};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::config::ResolverConfig;
use crate::errors::{Cancelled, DnsError};

const MAX_UDP_RESPONSE: usize = 4096;

/// Sends a single DNS message to a single server
#[async_trait]
pub trait DnsTransport: Send + Sync {
    async fn exchange(&self, server: SocketAddr, request: &Message) -> Result<Message, DnsError>;
}

/// Builds a query message for `name`/`record_type` with a random id.
pub fn build_query(name: &Name, record_type: RecordType, recursion_desired: bool) -> Message {
    let mut msg = Message::new();
    msg.set_id(rand::random::<u16>())
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(recursion_desired)
        .add_query(Query::query(name.clone(), record_type));
    msg
}

/// UDP transport with TCP fallback on truncation
#[derive(Debug, Default, Clone)]
pub struct NetworkTransport;

impl NetworkTransport {
    pub fn new() -> Self {
        Self
    }

    async fn exchange_udp(server: SocketAddr, request: &Message, wire: &[u8]) -> io::Result<Message> {
        let bind_addr: SocketAddr = if server.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(bind_addr).await?;
        socket.connect(server).await?;
        socket.send(wire).await?;

        let mut buf = vec![0u8; MAX_UDP_RESPONSE];
        loop {
            let len = socket.recv(&mut buf).await?;
            let response = decode(&buf[..len])?;
            // Stray datagrams with another id are not ours.
            if response.id() == request.id() {
                return Ok(response);
            }
            trace!(%server, expected = request.id(), got = response.id(), "Ignoring response with mismatched id");
        }
    }

    async fn exchange_tcp(server: SocketAddr, request: &Message, wire: &[u8]) -> io::Result<Message> {
        let len = u16::try_from(wire.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "query too large"))?;

        let mut stream = TcpStream::connect(server).await?;
        let mut frame = Vec::with_capacity(wire.len() + 2);
        frame.extend_from_slice(&len.to_be_bytes());
        frame.extend_from_slice(wire);
        stream.write_all(&frame).await?;

        let mut len_buf = [0u8; 2];
        stream.read_exact(&mut len_buf).await?;
        let mut buf = vec![0u8; u16::from_be_bytes(len_buf) as usize];
        stream.read_exact(&mut buf).await?;

        let response = decode(&buf)?;
        if response.id() != request.id() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "response id {} does not match query id {}",
                    response.id(),
                    request.id()
                ),
            ));
        }
        Ok(response)
    }
}

#[async_trait]
impl DnsTransport for NetworkTransport {
    async fn exchange(&self, server: SocketAddr, request: &Message) -> Result<Message, DnsError> {
        let call_error = |e: io::Error| {
            DnsError::new("DNS call error")
                .with_ns(server)
                .with_msg_out(request.clone())
                .with_source(e)
        };

        let wire = request.to_vec().map_err(|e| {
            DnsError::new("failed to encode query")
                .with_ns(server)
                .with_msg_out(request.clone())
                .with_source(e)
        })?;

        let response = Self::exchange_udp(server, request, &wire)
            .await
            .map_err(call_error)?;

        if !response.truncated() {
            return Ok(response);
        }

        debug!(%server, "Truncated UDP response, retrying over TCP");
        Self::exchange_tcp(server, request, &wire)
            .await
            .map_err(call_error)
    }
}

fn decode(buf: &[u8]) -> io::Result<Message> {
    Message::from_vec(buf).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// Query client bound to a transport and the resolver configuration
#[derive(Clone)]
pub struct DnsClient {
    transport: Arc<dyn DnsTransport>,
    config: Arc<ResolverConfig>,
}

impl DnsClient {
    /// Client talking to the network
    pub fn new(config: ResolverConfig) -> Self {
        Self::with_transport(config, Arc::new(NetworkTransport::new()))
    }

    pub fn with_transport(config: ResolverConfig, transport: Arc<dyn DnsTransport>) -> Self {
        Self {
            transport,
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    pub fn recursive_nameservers(&self) -> &[SocketAddr] {
        &self.config.nameservers
    }

    /// Sends one query to `server`.
    ///
    /// The exchange is bounded by the configured timeout and aborted as soon
    /// as `cancel` fires. Both surface as a [`DnsError`] naming the server.
    pub async fn query(
        &self,
        cancel: &CancellationToken,
        server: SocketAddr,
        name: &Name,
        record_type: RecordType,
        recursion_desired: bool,
    ) -> Result<Message, DnsError> {
        let request = build_query(name, record_type, recursion_desired);
        let timeout = self.config.timeout();

        trace!(%server, %name, %record_type, "Sending DNS query");

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(DnsError::new("DNS call error")
                .with_ns(server)
                .with_msg_out(request.clone())
                .with_source(Cancelled)),
            result = tokio::time::timeout(timeout, self.transport.exchange(server, &request)) => {
                match result {
                    Ok(response) => response,
                    Err(_) => Err(DnsError::new("DNS call error")
                        .with_ns(server)
                        .with_msg_out(request.clone())
                        .with_source(io::Error::new(
                            io::ErrorKind::TimedOut,
                            format!("i/o timeout after {:?}", timeout),
                        ))),
                }
            }
        }
    }

    /// Queries the recursive nameservers in order.
    ///
    /// Returns the first successful response carrying answers. Otherwise the
    /// last response received, or the last error when no server answered.
    pub async fn recursive_query(
        &self,
        cancel: &CancellationToken,
        name: &Name,
        record_type: RecordType,
    ) -> Result<Message, DnsError> {
        let mut last_response = None;
        let mut last_error = None;

        for server in self.recursive_nameservers() {
            match self.query(cancel, *server, name, record_type, true).await {
                Ok(response) => {
                    if response.response_code() == ResponseCode::NoError
                        && !response.answers().is_empty()
                    {
                        return Ok(response);
                    }
                    last_response = Some(response);
                }
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => {
                    debug!(%server, %name, error = %e, "Recursive nameserver failed");
                    last_error = Some(e);
                }
            }
        }

        match (last_response, last_error) {
            (Some(response), _) => Ok(response),
            (None, Some(e)) => Err(e),
            (None, None) => Err(DnsError::new("no recursive nameservers configured")
                .with_msg_out(build_query(name, record_type, true))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{txt_record, ScriptedTransport};
    use hickory_proto::rr::Record;
    use std::time::Duration;

    fn client(transport: Arc<ScriptedTransport>, nameservers: &[&str]) -> DnsClient {
        let config = ResolverConfig {
            timeout_secs: 1,
            ..ResolverConfig::with_nameservers(
                nameservers.iter().map(|ns| ns.parse().unwrap()).collect(),
            )
        };
        DnsClient::with_transport(config, transport)
    }

    fn response_for(request: &Message, answers: Vec<Record>, truncated: bool) -> Vec<u8> {
        let mut msg = Message::new();
        msg.set_id(request.id())
            .set_message_type(MessageType::Response)
            .set_op_code(OpCode::Query)
            .set_truncated(truncated);
        for query in request.queries() {
            msg.add_query(query.clone());
        }
        for answer in answers {
            msg.add_answer(answer);
        }
        msg.to_vec().unwrap()
    }

    #[test]
    fn test_build_query() {
        let name = Name::from_ascii("example.com.").unwrap();
        let msg = build_query(&name, RecordType::SOA, true);

        assert_eq!(msg.message_type(), MessageType::Query);
        assert!(msg.recursion_desired());
        assert_eq!(msg.queries().len(), 1);
        assert_eq!(msg.queries()[0].name(), &name);
        assert_eq!(msg.queries()[0].query_type(), RecordType::SOA);
    }

    #[tokio::test]
    async fn test_udp_truncation_falls_back_to_tcp() {
        let udp = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server = udp.local_addr().unwrap();
        let tcp = tokio::net::TcpListener::bind(server).await.unwrap();

        tokio::spawn(async move {
            let mut buf = vec![0u8; 512];
            let (len, peer) = udp.recv_from(&mut buf).await.unwrap();
            let request = Message::from_vec(&buf[..len]).unwrap();
            let reply = response_for(&request, vec![], true);
            udp.send_to(&reply, peer).await.unwrap();
        });

        tokio::spawn(async move {
            let (mut stream, _) = tcp.accept().await.unwrap();
            let mut len_buf = [0u8; 2];
            stream.read_exact(&mut len_buf).await.unwrap();
            let mut buf = vec![0u8; u16::from_be_bytes(len_buf) as usize];
            stream.read_exact(&mut buf).await.unwrap();
            let request = Message::from_vec(&buf).unwrap();
            let reply = response_for(
                &request,
                vec![txt_record("example.com.", "over-tcp")],
                false,
            );
            stream
                .write_all(&(reply.len() as u16).to_be_bytes())
                .await
                .unwrap();
            stream.write_all(&reply).await.unwrap();
        });

        let name = Name::from_ascii("example.com.").unwrap();
        let request = build_query(&name, RecordType::TXT, false);
        let response = NetworkTransport::new()
            .exchange(server, &request)
            .await
            .unwrap();

        assert!(!response.truncated());
        assert_eq!(response.answers().len(), 1);
    }

    #[tokio::test]
    async fn test_query_times_out() {
        // Bound but never answers.
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server = silent.local_addr().unwrap();

        let config = ResolverConfig {
            timeout_secs: 1,
            ..ResolverConfig::with_nameservers(vec![server])
        };
        let client = DnsClient::new(config);
        let name = Name::from_ascii("example.com.").unwrap();

        let err = client
            .query(&CancellationToken::new(), server, &name, RecordType::TXT, false)
            .await
            .unwrap_err();

        assert!(err.is_timeout());
        let rendered = err.to_string();
        assert!(rendered.starts_with("DNS call error: i/o timeout"));
        assert!(rendered.contains(&format!("ns={}", server)));
        assert!(rendered.contains("question='example.com. IN TXT'"));
        drop(silent);
    }

    #[tokio::test]
    async fn test_query_observes_cancellation() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.hang("slow.example.com.", RecordType::TXT);
        let client = client(transport, &["10.0.0.1:53"]);
        let name = Name::from_ascii("slow.example.com.").unwrap();

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let err = client
            .query(&cancel, "10.0.0.1:53".parse().unwrap(), &name, RecordType::TXT, false)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn test_recursive_query_falls_through_to_next_server() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.txt("example.com.", &["hello"]);
        transport.fail_server("10.0.0.1:53".parse().unwrap());
        let client = client(transport.clone(), &["10.0.0.1:53", "10.0.0.2:53"]);
        let name = Name::from_ascii("example.com.").unwrap();

        let response = client
            .recursive_query(&CancellationToken::new(), &name, RecordType::TXT)
            .await
            .unwrap();

        assert_eq!(response.answers().len(), 1);
        let servers: Vec<_> = transport.queries().into_iter().map(|q| q.server).collect();
        assert_eq!(
            servers,
            vec![
                "10.0.0.1:53".parse::<SocketAddr>().unwrap(),
                "10.0.0.2:53".parse().unwrap()
            ]
        );
    }

    #[tokio::test]
    async fn test_recursive_query_returns_last_error() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.fail_server("10.0.0.1:53".parse().unwrap());
        let client = client(transport, &["10.0.0.1:53"]);
        let name = Name::from_ascii("example.com.").unwrap();

        let err = client
            .recursive_query(&CancellationToken::new(), &name, RecordType::SOA)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("ns=10.0.0.1:53"));
    }
}
