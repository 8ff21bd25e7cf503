use std::env;
use std::hint::black_box;
use std::time::{Duration, Instant};
use wifirouter::{ClientId, ClientRegistry, MacAddress};

#[derive(Clone, Copy)]
struct BenchConfig {
    ops: usize,
    macs: usize,
    clients: usize,
    mode: BenchMode,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum BenchMode {
    Both,
    Register,
    Lookup,
}

fn main() {
    let cfg = parse_args().unwrap_or_else(|msg| {
        eprintln!("{msg}");
        eprintln!(
            "Usage: cargo run --release --bin registry_bench -- [--ops N] [--macs K] [--clients C] [--mode both|register|lookup]"
        );
        eprintln!("Defaults: --ops 5000000 --macs 20000 --clients 64");
        std::process::exit(2);
    });

    let macs = generate_macs(cfg.macs);
    println!("ClientRegistry benchmark");
    println!(
        "macs: {}, clients: {}, ops: {}, mode: {}",
        cfg.macs,
        cfg.clients,
        cfg.ops,
        mode_name(cfg.mode)
    );
    println!();

    if cfg.mode == BenchMode::Both || cfg.mode == BenchMode::Register {
        print_line("register", run_register(&macs, cfg.clients, cfg.ops), cfg.ops);
    }
    if cfg.mode == BenchMode::Both || cfg.mode == BenchMode::Lookup {
        print_line("lookup", run_lookup(&macs, cfg.clients, cfg.ops), cfg.ops);
    }
}

fn parse_args() -> Result<BenchConfig, String> {
    let mut cfg = BenchConfig {
        ops: 5_000_000,
        macs: 20_000,
        clients: 64,
        mode: BenchMode::Both,
    };
    let mut it = env::args().skip(1);
    while let Some(arg) = it.next() {
        let mut value = |name: &str| {
            it.next()
                .ok_or_else(|| format!("{name} requires a value"))
        };
        match arg.as_str() {
            "--ops" => cfg.ops = parse_positive_usize(&value("--ops")?, "--ops")?,
            "--macs" => cfg.macs = parse_positive_usize(&value("--macs")?, "--macs")?,
            "--clients" => cfg.clients = parse_positive_usize(&value("--clients")?, "--clients")?,
            "--mode" => cfg.mode = parse_mode(&value("--mode")?)?,
            "--help" | "-h" => return Err("help requested".to_string()),
            other => return Err(format!("unknown argument: {other}")),
        }
    }
    Ok(cfg)
}

fn parse_mode(s: &str) -> Result<BenchMode, String> {
    match s {
        "both" => Ok(BenchMode::Both),
        "register" => Ok(BenchMode::Register),
        "lookup" => Ok(BenchMode::Lookup),
        _ => Err(format!(
            "invalid --mode value: {s} (expected both|register|lookup)"
        )),
    }
}

fn mode_name(mode: BenchMode) -> &'static str {
    match mode {
        BenchMode::Both => "both",
        BenchMode::Register => "register",
        BenchMode::Lookup => "lookup",
    }
}

fn parse_positive_usize(s: &str, name: &str) -> Result<usize, String> {
    let v = s
        .parse::<usize>()
        .map_err(|_| format!("invalid value for {name}: {s}"))?;
    if v == 0 {
        return Err(format!("{name} must be > 0"));
    }
    Ok(v)
}

fn generate_macs(count: usize) -> Vec<MacAddress> {
    (0..count as u64)
        .map(|x| {
            MacAddress::new([
                0x02,
                ((x >> 32) & 0xff) as u8,
                ((x >> 24) & 0xff) as u8,
                ((x >> 16) & 0xff) as u8,
                ((x >> 8) & 0xff) as u8,
                (x & 0xff) as u8,
            ])
        })
        .collect()
}

fn connected(clients: usize) -> ClientRegistry<()> {
    let mut reg = ClientRegistry::new();
    for fd in 0..clients {
        reg.add(ClientId(fd as i32), ());
    }
    reg
}

struct Lcg(u64);

impl Lcg {
    fn next(&mut self) -> usize {
        self.0 = self
            .0
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        (self.0 >> 16) as usize
    }
}

fn run_register(macs: &[MacAddress], clients: usize, ops: usize) -> Duration {
    let mut reg = connected(clients);
    let mut rng = Lcg(0x0123_4567_89ab_cdef);
    let start = Instant::now();
    for _ in 0..ops {
        let mac = macs[rng.next() % macs.len()];
        let id = ClientId((rng.next() % clients) as i32);
        reg.register(mac, id);
    }
    let total = start.elapsed();
    black_box(reg.subscription_count());
    total
}

fn run_lookup(macs: &[MacAddress], clients: usize, ops: usize) -> Duration {
    let mut reg = connected(clients);
    for (i, mac) in macs.iter().enumerate() {
        reg.register(*mac, ClientId((i % clients) as i32));
    }
    let mut rng = Lcg(0xfedc_ba98_7654_3210);
    let start = Instant::now();
    let mut checksum = 0usize;
    for _ in 0..ops {
        let mac = macs[rng.next() % macs.len()];
        checksum ^= reg.subscribers_for(&mac).len();
    }
    let total = start.elapsed();
    black_box(checksum);
    total
}

fn print_line(name: &str, total: Duration, ops: usize) {
    println!(
        "{name:>8}: total = {:>10.3} ms, ns/op = {:>8.2}",
        total.as_secs_f64() * 1_000.0,
        (total.as_nanos() as f64) / (ops as f64)
    );
}
