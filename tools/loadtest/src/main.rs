// =============================================================================
// VISS GATEWAY — Load Test Tool
// =============================================================================
// Issues a random get/set mix against the HTTP adapter at a fixed rate and
// reports outcome counters and mean latency.
// =============================================================================

use clap::Parser;
use rand::seq::SliceRandom;
use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

const GET_PATHS: &[&str] = &[
    "Vehicle/Speed",
    "Vehicle/TraveledDistance",
    "Vehicle/CurrentLocation",
    "Vehicle/Powertrain/TractionBattery/StateOfCharge/Current",
    "Vehicle/Cabin/Door/Row1/Left/IsOpen",
];

// ungated actuators, so no token is needed
const SET_PATHS: &[&str] = &["Vehicle/Cabin/Lights/IsDomeOn"];

#[derive(Parser)]
#[command(name = "viss-loadtest")]
#[command(about = "Load generator for the VISS gateway HTTP adapter")]
struct Args {
    /// Gateway base URL
    #[arg(long, default_value = "http://localhost:8888")]
    url: String,

    /// Requests per second
    #[arg(long, default_value_t = 100)]
    rate: u32,

    /// Duration in seconds
    #[arg(long, default_value_t = 30)]
    duration: u64,

    /// Share of set requests, 0.0..=1.0
    #[arg(long, default_value_t = 0.2)]
    set_ratio: f64,

    /// Bearer token attached to every request
    #[arg(long)]
    token: Option<String>,
}

#[derive(Default)]
struct Counters {
    sent: AtomicU64,
    ok: AtomicU64,
    bad_request: AtomicU64,
    unauthorized: AtomicU64,
    unavailable: AtomicU64,
    other: AtomicU64,
    network_error: AtomicU64,
    latency_sum_us: AtomicU64,
}

impl Counters {
    fn record(&self, status: u16) {
        let c = match status {
            200 => &self.ok,
            400 | 404 => &self.bad_request,
            401 | 403 => &self.unauthorized,
            503 | 504 => &self.unavailable,
            _ => &self.other,
        };
        c.fetch_add(1, Ordering::Relaxed);
    }
}

fn build_request(client: &reqwest::blocking::Client, args: &Args, rng: &mut impl Rng) -> reqwest::blocking::RequestBuilder {
    let req = if rng.gen_bool(args.set_ratio.clamp(0.0, 1.0)) {
        let path = SET_PATHS.choose(rng).copied().unwrap_or("Vehicle/Cabin/Lights/IsDomeOn");
        let value = if rng.gen_bool(0.5) { "true" } else { "false" };
        client.post(format!("{}/{}", args.url, path)).body(value)
    } else {
        let path = GET_PATHS.choose(rng).copied().unwrap_or("Vehicle/Speed");
        client.get(format!("{}/{}", args.url, path))
    };
    match &args.token {
        Some(t) => req.bearer_auth(t),
        None => req,
    }
}

fn main() {
    let args = Args::parse();

    println!("=== VISS Gateway Load Test ===");
    println!("Target:    {}", args.url);
    println!("Rate:      {} req/s", args.rate);
    println!("Duration:  {}s", args.duration);
    println!("Set ratio: {:.2}", args.set_ratio);
    println!();

    let health_url = format!("{}/health", args.url);
    match reqwest::blocking::get(&health_url) {
        Ok(r) if r.status().is_success() => println!("Gateway health: OK"),
        Ok(r) => {
            eprintln!("Gateway health check failed: {}", r.status());
            std::process::exit(1);
        }
        Err(e) => {
            eprintln!("Cannot reach gateway: {}", e);
            std::process::exit(1);
        }
    }

    let client = match reqwest::blocking::Client::builder().timeout(Duration::from_secs(10)).build() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Cannot build HTTP client: {}", e);
            std::process::exit(1);
        }
    };

    let counters = Counters::default();
    let interval = Duration::from_micros(1_000_000 / args.rate.max(1) as u64);
    let deadline = Instant::now() + Duration::from_secs(args.duration);

    println!("\nSending...\n");
    let start = Instant::now();
    let mut rng = rand::thread_rng();
    let mut tick = 0u64;

    while Instant::now() < deadline {
        let req = build_request(&client, &args, &mut rng);
        let req_start = Instant::now();
        counters.sent.fetch_add(1, Ordering::Relaxed);

        match req.send() {
            Ok(resp) => {
                counters.latency_sum_us.fetch_add(req_start.elapsed().as_micros() as u64, Ordering::Relaxed);
                let status = resp.status().as_u16();
                counters.record(status);
                if status != 200 && tick < 5 {
                    eprintln!("Status {}: {}", status, resp.text().unwrap_or_default());
                }
            }
            Err(_) => {
                counters.network_error.fetch_add(1, Ordering::Relaxed);
            }
        }

        tick += 1;

        if tick % 500 == 0 {
            let elapsed = start.elapsed().as_secs_f64();
            let sent = counters.sent.load(Ordering::Relaxed);
            println!(
                "  [{:.1}s] sent={} ok={} bad={} unauth={} unavail={} err={} ({:.0} req/s)",
                elapsed,
                sent,
                counters.ok.load(Ordering::Relaxed),
                counters.bad_request.load(Ordering::Relaxed),
                counters.unauthorized.load(Ordering::Relaxed),
                counters.unavailable.load(Ordering::Relaxed),
                counters.network_error.load(Ordering::Relaxed),
                sent as f64 / elapsed,
            );
        }

        let target = Duration::from_micros(tick * interval.as_micros() as u64);
        let actual = start.elapsed();
        if actual < target {
            std::thread::sleep(target - actual);
        }
    }

    let elapsed = start.elapsed();
    let sent = counters.sent.load(Ordering::Relaxed);
    let ok = counters.ok.load(Ordering::Relaxed);
    let avg_lat = counters.latency_sum_us.load(Ordering::Relaxed) / sent.max(1);

    println!("\n=== Results ===");
    println!("Duration:     {:.2}s", elapsed.as_secs_f64());
    println!("Total sent:   {}", sent);
    println!("OK:           {} ({:.1}%)", ok, ok as f64 / sent.max(1) as f64 * 100.0);
    println!("Bad request:  {}", counters.bad_request.load(Ordering::Relaxed));
    println!("Unauthorized: {}", counters.unauthorized.load(Ordering::Relaxed));
    println!("Unavailable:  {}", counters.unavailable.load(Ordering::Relaxed));
    println!("Other:        {}", counters.other.load(Ordering::Relaxed));
    println!("Net errors:   {}", counters.network_error.load(Ordering::Relaxed));
    println!("Avg latency:  {} us", avg_lat);
    println!("Throughput:   {:.1} req/s", sent as f64 / elapsed.as_secs_f64());
}
