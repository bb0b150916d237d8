use std::env;
use std::io;
use std::process::ExitCode;

use lift_cli::{run, CommandKind, CommonOptions, JoinOptions};

fn main() -> ExitCode {
    match run_cli() {
        Ok(()) => ExitCode::SUCCESS,
        Err(message) => {
            eprintln!("{message}");
            ExitCode::from(1)
        }
    }
}

fn run_cli() -> Result<(), String> {
    let args = env::args().skip(1).collect::<Vec<_>>();
    if args.is_empty() {
        return Err(usage_text());
    }
    if args[0] == "-h" || args[0] == "--help" {
        print_usage();
        return Ok(());
    }

    let mut options = CommonOptions::default();
    let mut index = 0usize;
    while index < args.len() {
        match args[index].as_str() {
            "--port" => {
                options.port = parse_value(&args, index, "--port", "u16")?;
                index += 2;
            }
            "--timeout-ms" => {
                options.timeout_ms = parse_value(&args, index, "--timeout-ms", "u64")?;
                index += 2;
            }
            "--retry-ms" => {
                options.retry_ms = parse_value(&args, index, "--retry-ms", "u64")?;
                index += 2;
            }
            "--include-telemetry" => {
                options.include_telemetry = true;
                index += 1;
            }
            _ => break,
        }
    }

    let command = args
        .get(index)
        .ok_or_else(|| "missing subcommand".to_string())?
        .as_str();
    let command_args = &args[(index + 1)..];

    let kind = match command {
        "wait-ready" => {
            if !command_args.is_empty() {
                return Err("wait-ready takes no arguments".to_string());
            }
            CommandKind::WaitReady
        }
        "send" => {
            if command_args.is_empty() {
                return Err("send requires a JSON command payload".to_string());
            }
            CommandKind::Send {
                command: command_args.join(" "),
            }
        }
        "join" => CommandKind::Join(parse_join_args(command_args)?),
        other => return Err(format!("unknown subcommand '{other}'")),
    };

    run(kind, options, &mut io::stdout())
}

fn parse_join_args(args: &[String]) -> Result<JoinOptions, String> {
    let mut join = JoinOptions::default();
    let mut index = 0usize;
    while index < args.len() {
        match args[index].as_str() {
            "--name" => {
                join.name = args
                    .get(index + 1)
                    .ok_or_else(|| "missing value for --name".to_string())?
                    .clone();
                index += 2;
            }
            "--world" => {
                join.world_template = parse_value(args, index, "--world", "u32")?;
                index += 2;
            }
            "--load-ms" => {
                join.load_ms = parse_value(args, index, "--load-ms", "u64")?;
                index += 2;
            }
            "--transfer-timeout-ms" => {
                join.transfer_timeout_ms =
                    parse_value(args, index, "--transfer-timeout-ms", "u64")?;
                index += 2;
            }
            "--skip-ready" => {
                join.skip_ready = true;
                index += 1;
            }
            other => return Err(format!("unknown join argument '{other}'")),
        }
    }
    Ok(join)
}

fn parse_value<T: std::str::FromStr>(
    args: &[String],
    index: usize,
    flag: &str,
    expected: &str,
) -> Result<T, String> {
    let value = args
        .get(index + 1)
        .ok_or_else(|| format!("missing value for {flag}"))?;
    value
        .parse::<T>()
        .map_err(|_| format!("invalid {flag} value '{value}' (expected {expected})"))
}

fn print_usage() {
    println!("{}", usage_text());
}

fn usage_text() -> String {
    [
        "lift_cli - line client for the lift staging server",
        "",
        "Usage:",
        "  lift_cli [--port <u16>] [--timeout-ms <u64>] [--retry-ms <u64>] [--include-telemetry] wait-ready",
        "  lift_cli [--port <u16>] [--timeout-ms <u64>] [--retry-ms <u64>] [--include-telemetry] send <json...>",
        "  lift_cli [--port <u16>] [--timeout-ms <u64>] [--retry-ms <u64>] [--include-telemetry] join [--name <name>] [--world <u32>] [--load-ms <u64>] [--transfer-timeout-ms <u64>] [--skip-ready]",
        "",
        "Defaults:",
        "  --port 46100",
        "  --timeout-ms 5000",
        "  --retry-ms 100",
        "  --world 1",
        "  --transfer-timeout-ms 60000",
    ]
    .join("\n")
}
