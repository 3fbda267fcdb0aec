//! Performance benchmarks for the per request wire work of the relay

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use doh_relay::dns::doh::{decode_message, encode_message};
use doh_relay::dns::protocol::{DnsPacket, DnsQuestion, DnsRecord, QueryType, TransientTtl};
use doh_relay::dns::ttl;
use std::net::Ipv4Addr;

fn create_response(answers: usize) -> DnsPacket {
    let mut query = DnsPacket::new();
    query.header.id = 0xBEEF;
    query.header.recursion_desired = true;
    query
        .questions
        .push(DnsQuestion::new("www.example.com".to_string(), QueryType::A));

    let mut response = DnsPacket::reply_to(&query);
    for i in 0..answers {
        response.answers.push(DnsRecord::A {
            domain: "www.example.com".to_string(),
            addr: Ipv4Addr::new(192, 0, 2, (i % 256) as u8),
            ttl: TransientTtl(300 + i as u32),
        });
    }

    response
}

fn benchmark_query_unpack(c: &mut Criterion) {
    let encoded = "AAABAAABAAAAAAAAA3d3dwdleGFtcGxlA2NvbQAAAQAB";

    let mut group = c.benchmark_group("query_unpack");
    group.bench_function("decode_and_parse_get_parameter", |b| {
        b.iter(|| {
            let data = decode_message(black_box(encoded)).unwrap();
            DnsPacket::from_bytes(&data).unwrap()
        });
    });
    group.finish();
}

fn benchmark_response_pack(c: &mut Criterion) {
    let mut group = c.benchmark_group("response_pack");
    group.throughput(Throughput::Elements(1));

    for answers in [1usize, 8, 32].iter() {
        let response = create_response(*answers);
        group.bench_with_input(
            BenchmarkId::from_parameter(answers),
            &response,
            |b, response| {
                b.iter(|| {
                    let mut response = response.clone();
                    black_box(response.to_bytes().unwrap())
                });
            },
        );
    }
    group.finish();
}

fn benchmark_response_parse(c: &mut Criterion) {
    let mut group = c.benchmark_group("response_parse");

    for answers in [1usize, 8, 32].iter() {
        let data = create_response(*answers).to_bytes().unwrap();
        group.bench_with_input(BenchmarkId::from_parameter(answers), &data, |b, data| {
            b.iter(|| DnsPacket::from_bytes(black_box(data)).unwrap());
        });
    }
    group.finish();
}

fn benchmark_ttl(c: &mut Criterion) {
    let response = create_response(16);

    let mut group = c.benchmark_group("ttl");
    group.bench_function("overall_ttl", |b| {
        b.iter(|| ttl::overall_ttl(Some(black_box(&response))));
    });
    group.bench_function("clamp_ttls", |b| {
        b.iter(|| {
            let mut response = response.clone();
            ttl::clamp_ttls(&mut response, 310);
            response
        });
    });
    group.finish();
}

fn benchmark_base64url(c: &mut Criterion) {
    let data = create_response(4).to_bytes().unwrap();
    let encoded = encode_message(&data);

    let mut group = c.benchmark_group("base64url");
    group.throughput(Throughput::Bytes(data.len() as u64));
    group.bench_function("encode", |b| b.iter(|| encode_message(black_box(&data))));
    group.bench_function("decode", |b| {
        b.iter(|| decode_message(black_box(&encoded)).unwrap())
    });
    group.finish();
}

criterion_group!(
    benches,
    benchmark_query_unpack,
    benchmark_response_pack,
    benchmark_response_parse,
    benchmark_ttl,
    benchmark_base64url
);
criterion_main!(benches);
