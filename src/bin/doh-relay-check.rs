//! Smoke test for a running relay: an RFC 8484 GET, a POST of a query for
//! `--name` and an ANY query that must come back as the RFC 8482 HINFO.

use std::process;
use std::time::Duration;

use clap::Parser;
use derive_more::{Display, Error, From};
use url::Url;

use doh_relay::dns::doh::{decode_message, DOH_CONTENT_TYPE_MESSAGE};
use doh_relay::dns::protocol::{DnsPacket, DnsQuestion, DnsRecord, ProtocolError, QueryType};
use doh_relay::dns::rfc8482::HINFO_CPU;

/// RFC 8484 section 4.1.1: id 0, RD set, A query for www.example.com
const RFC8484_GET_EXAMPLE: &str = "AAABAAABAAAAAAAAA3d3dwdleGFtcGxlA2NvbQAAAQAB";

#[derive(Parser)]
#[command(name = "doh-relay-check")]
#[command(version, about = "Smoke test a running DNS-over-HTTPS relay", long_about = None)]
struct Cli {
    /// Relay endpoint
    #[arg(long, default_value = "http://127.0.0.1:8080/dns-query")]
    url: String,

    /// Name queried by the POST and ANY checks
    #[arg(long, default_value = "www.example.com")]
    name: String,

    /// Whitelisted key sent as the `token` query parameter
    #[arg(long)]
    token: Option<String>,

    /// Request timeout in seconds
    #[arg(long, default_value_t = 10)]
    timeout: u64,
}

#[derive(Debug, Display, From, Error)]
enum CheckError {
    Http(reqwest::Error),
    Url(url::ParseError),
    Protocol(ProtocolError),
    Base64(base64::DecodeError),
    #[display(fmt = "{}", reason)]
    #[from(ignore)]
    Failed { reason: String },
}

type Result<T> = std::result::Result<T, CheckError>;

fn failed(reason: String) -> CheckError {
    CheckError::Failed { reason }
}

struct Checker {
    client: reqwest::blocking::Client,
    url: Url,
    token: Option<String>,
}

impl Checker {
    fn new(cli: &Cli) -> Result<Checker> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(cli.timeout))
            .build()?;

        Ok(Checker {
            client,
            url: Url::parse(&cli.url)?,
            token: cli.token.clone(),
        })
    }

    fn endpoint(&self) -> Url {
        let mut url = self.url.clone();
        if let Some(token) = &self.token {
            url.query_pairs_mut().append_pair("token", token);
        }
        url
    }

    fn get(&self, encoded: &str) -> Result<DnsPacket> {
        let mut url = self.endpoint();
        url.query_pairs_mut().append_pair("dns", encoded);

        let response = self
            .client
            .get(url)
            .header("Accept", DOH_CONTENT_TYPE_MESSAGE)
            .send()?;

        read_reply(response)
    }

    fn post(&self, body: Vec<u8>) -> Result<DnsPacket> {
        let response = self
            .client
            .post(self.endpoint())
            .header("Content-Type", DOH_CONTENT_TYPE_MESSAGE)
            .header("Accept", DOH_CONTENT_TYPE_MESSAGE)
            .body(body)
            .send()?;

        read_reply(response)
    }
}

fn read_reply(response: reqwest::blocking::Response) -> Result<DnsPacket> {
    let status = response.status();
    let cache_control = response
        .headers()
        .get("Cache-Control")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string());
    let body = response.bytes()?;

    if !status.is_success() {
        return Err(failed(format!(
            "relay answered {}: {}",
            status,
            String::from_utf8_lossy(&body)
        )));
    }

    println!(
        "  cache-control: {}",
        cache_control.as_deref().unwrap_or("(none)")
    );

    Ok(DnsPacket::from_bytes(&body)?)
}

fn build_query(name: &str, qtype: QueryType) -> DnsPacket {
    let mut packet = DnsPacket::new();
    packet.header.id = rand::random();
    packet.header.recursion_desired = true;
    packet
        .questions
        .push(DnsQuestion::new(name.to_string(), qtype));

    packet
}

fn expect_reply(query: &DnsPacket, reply: &DnsPacket) -> Result<()> {
    if reply.header.id != query.header.id {
        return Err(failed(format!(
            "reply id {} does not match query id {}",
            reply.header.id, query.header.id
        )));
    }

    let matches = match (query.questions.first(), reply.questions.first()) {
        (Some(q), Some(r)) => {
            q.fqdn().eq_ignore_ascii_case(&r.fqdn()) && q.qtype == r.qtype && q.qclass == r.qclass
        }
        _ => false,
    };
    if !matches {
        return Err(failed("reply does not echo the question".to_string()));
    }

    println!("  rcode: {:?}", reply.header.rescode);
    for record in &reply.answers {
        println!("  {:?}", record);
    }

    Ok(())
}

fn check_get(checker: &Checker) -> Result<()> {
    let query = DnsPacket::from_bytes(&decode_message(RFC8484_GET_EXAMPLE)?)?;
    let reply = checker.get(RFC8484_GET_EXAMPLE)?;

    expect_reply(&query, &reply)
}

fn check_post(checker: &Checker, name: &str) -> Result<()> {
    let mut query = build_query(name, QueryType::A);
    let reply = checker.post(query.to_bytes()?)?;

    expect_reply(&query, &reply)
}

fn check_any(checker: &Checker, name: &str) -> Result<()> {
    let mut query = build_query(name, QueryType::Any);
    let reply = checker.post(query.to_bytes()?)?;
    expect_reply(&query, &reply)?;

    match reply.answers.as_slice() {
        [DnsRecord::Hinfo { cpu, .. }] if cpu == HINFO_CPU => Ok(()),
        _ => Err(failed(format!(
            "expected a single {} HINFO answer, got {} answers",
            HINFO_CPU,
            reply.answers.len()
        ))),
    }
}

fn run(cli: &Cli) -> Result<()> {
    let checker = Checker::new(cli)?;

    println!("GET {}", RFC8484_GET_EXAMPLE);
    check_get(&checker)?;

    println!("POST {} A", cli.name);
    check_post(&checker, &cli.name)?;

    println!("POST {} ANY", cli.name);
    check_any(&checker, &cli.name)?;

    Ok(())
}

fn main() {
    let cli = Cli::parse();

    match run(&cli) {
        Ok(()) => println!("all checks passed"),
        Err(e) => {
            eprintln!("check failed: {}", e);
            process::exit(1);
        }
    }
}
