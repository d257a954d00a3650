use clap::Parser;
use idempotency_stress_tests::history::ViolationKind;
use idempotency_stress_tests::server;
use idempotency_stress_tests::worker;
use idempotency_stress_tests::workload::WorkloadProfile;
use std::io::Write;
use std::process;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "idempotency-stress", about = "Idempotency gate stress test harness")]
struct Args {
    /// How long to run (seconds)
    #[arg(long, default_value_t = 5)]
    duration: u64,

    /// Workload profile: typical | retry-heavy | conflicted
    #[arg(long, default_value = "typical")]
    workload: String,

    /// Number of distinct idempotency keys kept in the reuse pool
    #[arg(long, default_value_t = 1000)]
    key_space: usize,

    /// Fail if the 5xx error rate exceeds this fraction
    #[arg(long, default_value_t = 0.01)]
    max_error_rate: f64,

    /// Fail if correctness violations exceed this count
    #[arg(long, default_value_t = 0)]
    max_violations: u64,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let profile = WorkloadProfile::from_name(&args.workload).unwrap_or_else(|| {
        eprintln!("Unknown workload {:?}. Valid values: typical, retry-heavy, conflicted", args.workload);
        process::exit(3);
    });

    let server = server::spawn_server().unwrap_or_else(|e| {
        eprintln!("Failed to start server: {e}");
        process::exit(3);
    });

    println!("Server ready: {}", server.addr);

    let base_url = server.base_url();
    let duration = Duration::from_secs(args.duration);

    print!("Running {}s {} workload ", args.duration, profile.as_name());
    std::io::stdout().flush().ok();

    let dot_handle = tokio::spawn(async {
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        interval.tick().await; // consume the immediate first tick
        loop {
            interval.tick().await;
            print!(".");
            std::io::stdout().flush().ok();
        }
    });

    let (metrics, history) = worker::run(&base_url, profile, args.key_space, duration).await;

    dot_handle.abort();
    println!();

    drop(server);

    let violations = history.check_correctness();
    let violation_count = violations.len() as u64;

    print_report(&args, &metrics, violation_count, profile);

    for v in &violations {
        let detail = match &v.kind {
            ViolationKind::DuplicateExecution { first_body, second_body } => {
                format!("DuplicateExecution: first {} bytes, second {} bytes", first_body.len(), second_body.len())
            }
            ViolationKind::StaleReplay { expected, actual } => {
                format!("StaleReplay: expected {} bytes, got {} bytes", expected.len(), actual.len())
            }
            ViolationKind::ReplayWithoutOrigin { actual } => {
                format!("ReplayWithoutOrigin: got {} bytes for a key with no recorded origin", actual.len())
            }
        };
        eprintln!("VIOLATION key={} {}", v.key, detail);
    }

    let error_rate_exceeded = metrics.requests_total > 0 && metrics.error_rate() > args.max_error_rate;
    let violations_exceeded = violation_count > args.max_violations;

    let exit_code = if error_rate_exceeded {
        1
    } else if violations_exceeded {
        2
    } else {
        0
    };

    process::exit(exit_code);
}

fn print_report(args: &Args, metrics: &idempotency_stress_tests::metrics::Metrics, violation_count: u64, profile: WorkloadProfile) {
    let pass_fail = |exceeded: bool| if exceeded { "✗" } else { "✓" };

    let error_rate_exceeded = metrics.requests_total > 0 && metrics.error_rate() > args.max_error_rate;
    let violations_exceeded = violation_count > args.max_violations;
    let overall_pass = !error_rate_exceeded && !violations_exceeded;

    println!("Idempotency Gate Stress Test Results");
    println!("=====================================");
    println!("Duration:              {:.1} s", args.duration as f64);
    println!("Workload:              {}", profile.as_name());
    println!("Key pool size:         {}", args.key_space);
    println!();
    println!("Requests:              {}", format_thousands(metrics.requests_total));
    println!("Throughput:            {:.1} rps", metrics.throughput_rps());
    println!("P50 latency:           {:.1} ms", ns_to_ms(metrics.p50_ns()));
    println!("P99 latency:           {:.1} ms", ns_to_ms(metrics.p99_ns()));
    println!();
    println!("5xx errors:            {}", format_thousands(metrics.errors_5xx));
    println!(
        "Error rate:            {:.3}%    [threshold: {:.3}%]  {}",
        metrics.error_rate() * 100.0,
        args.max_error_rate * 100.0,
        pass_fail(error_rate_exceeded),
    );
    println!();
    println!(
        "Correctness violations: {}        [threshold: {}]        {}",
        violation_count,
        args.max_violations,
        pass_fail(violations_exceeded),
    );
    println!();
    println!("Result: {}", if overall_pass { "PASS" } else { "FAIL" });
}

fn format_thousands(n: u64) -> String {
    if n >= 1_000_000 {
        format!("~{}M", n / 1_000_000)
    } else if n >= 1_000 {
        format!("~{}K", n / 1_000)
    } else {
        n.to_string()
    }
}

fn ns_to_ms(ns: u64) -> f64 {
    ns as f64 / 1_000_000.0
}
