//! Scripted in-memory transport for unit tests

use std::collections::{HashMap, HashSet};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Mutex;

use async_trait::async_trait;
use hickory_proto::op::{Message, MessageType, OpCode, ResponseCode};
use hickory_proto::rr::rdata::{A, AAAA, CNAME, NS, SOA, TXT};
use hickory_proto::rr::{Name, RData, Record, RecordType};

use crate::errors::DnsError;
use crate::fqdn::to_fqdn;
use crate::transport::DnsTransport;

#[derive(Debug, Clone)]
pub struct LoggedQuery {
    pub server: SocketAddr,
    pub name: String,
    pub record_type: RecordType,
}

#[derive(Debug, Clone)]
enum Script {
    Answer {
        code: ResponseCode,
        answers: Vec<Record>,
    },
    Fail,
    Hang,
}

type Key = (String, RecordType);

/// Answers from a fixed table; names not in the table get NXDOMAIN.
#[derive(Default)]
pub struct ScriptedTransport {
    scripts: Mutex<HashMap<Key, Script>>,
    per_server: Mutex<HashMap<(SocketAddr, String, RecordType), Script>>,
    failing_servers: Mutex<HashSet<SocketAddr>>,
    log: Mutex<Vec<LoggedQuery>>,
}

fn key(name: &str) -> String {
    to_fqdn(name).to_lowercase()
}

fn name(value: &str) -> Name {
    Name::from_ascii(to_fqdn(value)).unwrap()
}

pub fn txt_record(owner: &str, value: &str) -> Record {
    Record::from_rdata(name(owner), 300, RData::TXT(TXT::new(vec![value.to_string()])))
}

pub fn soa_record(zone: &str) -> Record {
    let zone = to_fqdn(zone);
    Record::from_rdata(
        name(&zone),
        300,
        RData::SOA(SOA::new(
            name(&format!("ns1.{}", zone)),
            name(&format!("hostmaster.{}", zone)),
            2024010101,
            7200,
            3600,
            1209600,
            300,
        )),
    )
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn set(&self, owner: &str, record_type: RecordType, script: Script) {
        self.scripts
            .lock()
            .unwrap()
            .insert((key(owner), record_type), script);
    }

    fn answer(&self, owner: &str, record_type: RecordType, answers: Vec<Record>) {
        self.set(
            owner,
            record_type,
            Script::Answer {
                code: ResponseCode::NoError,
                answers,
            },
        );
    }

    pub fn soa(&self, zone: &str) {
        self.answer(zone, RecordType::SOA, vec![soa_record(zone)]);
    }

    pub fn rcode(&self, owner: &str, record_type: RecordType, code: ResponseCode) {
        self.set(
            owner,
            record_type,
            Script::Answer {
                code,
                answers: vec![],
            },
        );
    }

    pub fn empty(&self, owner: &str, record_type: RecordType) {
        self.answer(owner, record_type, vec![]);
    }

    pub fn ns(&self, zone: &str, hosts: &[&str]) {
        let records = hosts
            .iter()
            .map(|host| Record::from_rdata(name(zone), 300, RData::NS(NS(name(host)))))
            .collect();
        self.answer(zone, RecordType::NS, records);
    }

    pub fn a(&self, host: &str, ip: &str) {
        let ip: Ipv4Addr = ip.parse().unwrap();
        self.answer(
            host,
            RecordType::A,
            vec![Record::from_rdata(name(host), 300, RData::A(A(ip)))],
        );
    }

    pub fn aaaa(&self, host: &str, ip: &str) {
        let ip: Ipv6Addr = ip.parse().unwrap();
        self.answer(
            host,
            RecordType::AAAA,
            vec![Record::from_rdata(name(host), 300, RData::AAAA(AAAA(ip)))],
        );
    }

    pub fn cname(&self, owner: &str, target: &str) {
        self.answer(
            owner,
            RecordType::CNAME,
            vec![Record::from_rdata(
                name(owner),
                300,
                RData::CNAME(CNAME(name(target))),
            )],
        );
    }

    pub fn txt(&self, owner: &str, values: &[&str]) {
        let records = values.iter().map(|v| txt_record(owner, v)).collect();
        self.answer(owner, RecordType::TXT, records);
    }

    /// TXT answer served only by `server`.
    pub fn txt_on(&self, server: SocketAddr, owner: &str, values: &[&str]) {
        let records = values.iter().map(|v| txt_record(owner, v)).collect();
        self.per_server.lock().unwrap().insert(
            (server, key(owner), RecordType::TXT),
            Script::Answer {
                code: ResponseCode::NoError,
                answers: records,
            },
        );
    }

    pub fn fail(&self, owner: &str, record_type: RecordType) {
        self.set(owner, record_type, Script::Fail);
    }

    pub fn hang(&self, owner: &str, record_type: RecordType) {
        self.set(owner, record_type, Script::Hang);
    }

    pub fn fail_server(&self, server: SocketAddr) {
        self.failing_servers.lock().unwrap().insert(server);
    }

    pub fn queries(&self) -> Vec<LoggedQuery> {
        self.log.lock().unwrap().clone()
    }

    pub fn count(&self, record_type: RecordType) -> usize {
        self.log
            .lock()
            .unwrap()
            .iter()
            .filter(|q| q.record_type == record_type)
            .count()
    }
}

#[async_trait]
impl DnsTransport for ScriptedTransport {
    async fn exchange(&self, server: SocketAddr, request: &Message) -> Result<Message, DnsError> {
        let query = request.queries()[0].clone();
        let owner = query.name().to_string().to_lowercase();
        let record_type = query.query_type();

        self.log.lock().unwrap().push(LoggedQuery {
            server,
            name: owner.clone(),
            record_type,
        });

        let failing = self.failing_servers.lock().unwrap().contains(&server);
        let script = if failing {
            Script::Fail
        } else {
            let per_server = self
                .per_server
                .lock()
                .unwrap()
                .get(&(server, owner.clone(), record_type))
                .cloned();
            per_server
                .or_else(|| {
                    self.scripts
                        .lock()
                        .unwrap()
                        .get(&(owner.clone(), record_type))
                        .cloned()
                })
                .unwrap_or(Script::Answer {
                    code: ResponseCode::NXDomain,
                    answers: vec![],
                })
        };

        match script {
            Script::Answer { code, answers } => {
                let mut response = Message::new();
                response
                    .set_id(request.id())
                    .set_message_type(MessageType::Response)
                    .set_op_code(OpCode::Query)
                    .set_response_code(code)
                    .add_query(query);
                for answer in answers {
                    response.add_answer(answer);
                }
                Ok(response)
            }
            Script::Fail => Err(DnsError::new("DNS call error")
                .with_ns(server)
                .with_msg_out(request.clone())
                .with_source(std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    "connection refused",
                ))),
            Script::Hang => std::future::pending().await,
        }
    }
}
