//! Performance benchmarks for output classification.
//!
//! Every line a VPN client prints goes through the classifier, so these
//! benchmarks measure:
//! - The common case of an ordinary line matching no rule
//! - Lines matching early and late rules of the built-in table
//! - A burst of mixed output as seen during connection setup

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use daemon::Classifier;

const STARTUP_LOG: &[&str] = &[
    "2024-05-01 10:00:00 OpenVPN 2.6.8 x86_64-pc-linux-gnu [SSL (OpenSSL)] [LZO] [LZ4] [EPOLL]",
    "2024-05-01 10:00:00 library versions: OpenSSL 3.0.13 30 Jan 2024, LZO 2.10",
    "2024-05-01 10:00:00 TCP/UDP: Preserving recently used remote address: [AF_INET]203.0.113.7:1194",
    "2024-05-01 10:00:00 UDPv4 link local: (not bound)",
    "2024-05-01 10:00:00 UDPv4 link remote: [AF_INET]203.0.113.7:1194",
    "Enter Auth Username:",
    "Enter Auth Password:",
    "2024-05-01 10:00:01 TLS: Initial packet from [AF_INET]203.0.113.7:1194",
    "2024-05-01 10:00:01 VERIFY OK: depth=0, CN=vpn.example.com",
    "2024-05-01 10:00:01 Control Channel: TLSv1.3, cipher TLSv1.3 TLS_AES_256_GCM_SHA384",
    "2024-05-01 10:00:02 PUSH: Received control message: 'PUSH_REPLY,route 10.8.0.1'",
    "2024-05-01 10:00:02 TUN/TAP device tun0 opened",
    "2024-05-01 10:00:02 net_addr_v4_add: 10.8.0.6/24 dev tun0",
    "2024-05-01 10:00:02 Initialization Sequence Completed",
];

/// Benchmark single lines against the built-in table.
fn bench_single_line(c: &mut Criterion) {
    let classifier = Classifier::openvpn().unwrap();
    let mut group = c.benchmark_group("classify_line");

    let cases = [
        ("info", "2024-05-01 10:00:01 VERIFY OK: depth=0, CN=vpn.example.com"),
        ("connected", "2024-05-01 10:00:02 Initialization Sequence Completed"),
        ("auth_request", "Enter Auth Password:"),
        ("fatal", "2024-05-01 10:00:02 Cannot open TUN/TAP dev /dev/net/tun: No such file"),
    ];

    for (name, line) in cases {
        group.throughput(Throughput::Bytes(line.len() as u64));
        group.bench_function(name, |b| b.iter(|| classifier.classify(black_box(line))));
    }

    group.finish();
}

/// Benchmark a full connection log.
fn bench_startup_log(c: &mut Criterion) {
    let classifier = Classifier::openvpn().unwrap();
    let mut group = c.benchmark_group("classify_startup_log");

    let bytes: usize = STARTUP_LOG.iter().map(|l| l.len()).sum();
    group.throughput(Throughput::Bytes(bytes as u64));
    group.bench_function("openvpn_2_6", |b| {
        b.iter(|| {
            for line in STARTUP_LOG {
                black_box(classifier.classify(black_box(line)));
            }
        })
    });

    group.finish();
}

/// Benchmark building the rule table.
fn bench_compile(c: &mut Criterion) {
    c.bench_function("compile_openvpn_rules", |b| {
        b.iter(|| Classifier::openvpn().unwrap())
    });
}

criterion_group!(benches, bench_single_line, bench_startup_log, bench_compile);
criterion_main!(benches);
