//! `imisc`: invoke one IMISC operation and print the outcome.

use std::process::ExitCode;
use std::time::{Duration, Instant};

use anyhow::Context as _;
use clap::Parser;
use remop_core::imisc::{self, Data, Ia5List};
use remop_runtime::logging::{init_tracing, LogFormat};
use remop_runtime::{ClientConfig, ImiscClient, InvokeError};

#[derive(Debug, Parser)]
#[command(name = "imisc", version, about = "Invoke an IMISC remote operation")]
struct Args {
    /// Performer address, `host:port`.
    address: String,

    /// Operation name, e.g. `utcTime`, `finger`, `echo`.
    operation: String,

    /// Operation arguments. `finger` and `tellUser` take a list of strings;
    /// `sink` and `echo` take one JSON value.
    args: Vec<String>,

    /// Invocation timeout in milliseconds.
    #[arg(long, env = "IMISC_TIMEOUT_MS", default_value_t = 10_000)]
    timeout_ms: u64,

    #[arg(long, value_enum, env = "IMISC_LOG_FORMAT", default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

/// Parses the JSON argument of `sink` and `echo`. No argument means nil.
fn parse_data(args: &[String]) -> anyhow::Result<Data> {
    if args.is_empty() {
        return Ok(Data(rmpv::Value::Nil));
    }
    let json: serde_json::Value =
        serde_json::from_str(&args.join(" ")).context("argument is not valid JSON")?;
    let value = rmpv::ext::to_value(json).context("argument cannot be represented")?;
    Ok(Data(value))
}

fn parse_list(args: &[String]) -> anyhow::Result<Ia5List> {
    Ia5List::new(args).map_err(|e| anyhow::anyhow!("argument {} is not IA5 text", e.index + 1))
}

async fn run(args: &Args) -> anyhow::Result<Vec<String>> {
    let table = imisc::table();
    if table.by_name(&args.operation).is_none() {
        let known: Vec<&str> = table.operations().map(|d| d.name).collect();
        anyhow::bail!("unknown operation {:?}; expected one of {}", args.operation, known.join(", "));
    }

    let config = ClientConfig {
        default_timeout: Duration::from_millis(args.timeout_ms),
        ..ClientConfig::default()
    };
    let client = ImiscClient::connect_tcp(args.address.as_str(), config).await?;

    let lines = match args.operation.as_str() {
        "utcTime" => vec![client.utc_time().await?.0],
        "timeOfDay" => vec![client.time_of_day().await?.0.to_string()],
        "users" => client.users().await?.into_vec(),
        "charGen" => client.char_gen().await?.into_vec(),
        "qotd" => client.qotd().await?.into_vec(),
        "finger" => client.finger(&parse_list(&args.args)?).await?.into_vec(),
        "pwdGen" => client.pwd_gen().await?.into_vec(),
        "genTime" => vec![client.gen_time().await?.0],
        "tellUser" => {
            client.tell_user(&parse_list(&args.args)?).await?;
            Vec::new()
        }
        "ping" => {
            let started = Instant::now();
            client.ping().await?;
            vec![format!("alive ({:.1} ms)", started.elapsed().as_secs_f64() * 1000.0)]
        }
        "sink" => {
            client.sink(&parse_data(&args.args)?).await?;
            Vec::new()
        }
        "echo" => {
            let data = client.echo(&parse_data(&args.args)?).await?;
            vec![serde_json::to_string(&data.0)?]
        }
        other => anyhow::bail!("operation {other:?} has no command"),
    };

    client.close().await;
    Ok(lines)
}

/// Error text for the user; IMISC errors are shown by name with their parameter.
fn describe(err: &anyhow::Error) -> String {
    match err.downcast_ref::<InvokeError>() {
        Some(invoke) => match invoke.imisc() {
            Some(imisc) => imisc.to_string(),
            None => invoke.to_string(),
        },
        None => format!("{err:#}"),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    if let Err(e) = init_tracing(args.log_format) {
        eprintln!("imisc: {e:#}");
        return ExitCode::FAILURE;
    }

    match run(&args).await {
        Ok(lines) => {
            for line in lines {
                println!("{line}");
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("imisc: {}", describe(&e));
            ExitCode::FAILURE
        }
    }
}
