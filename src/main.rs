use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tunnel_broker::prelude::*;
use tunnel_broker::logging;

/// Run one statement through the tunnelled connection pool.
#[derive(Parser, Debug)]
#[command(name = "tunnel-broker", version, about)]
struct Args {
    /// SQL text; `%s` markers are bound to `--param` values in order.
    query: String,

    #[arg(short, long, value_enum, default_value_t = OperationMode::Fetch)]
    mode: OperationMode,

    /// Statement parameter; repeat for each `%s`. `null`, booleans and numbers are typed.
    #[arg(short, long = "param", value_name = "VALUE")]
    params: Vec<String>,

    /// Worker label attached to log lines.
    #[arg(short, long)]
    label: Option<String>,

    /// Send the SQL to the server without rewriting `%s` markers.
    #[arg(long)]
    no_translate: bool,

    /// Read settings from this dotenv file instead of `./.env`.
    #[arg(long, value_name = "PATH")]
    env_file: Option<PathBuf>,

    /// Print the broker status as JSON on stderr before shutting down.
    #[arg(long)]
    status: bool,
}

fn main() -> ExitCode {
    logging::init("info");
    let args = Args::parse();

    let broker = match args.env_file.as_deref() {
        Some(path) => BrokerConfig::from_env_file(path).and_then(tunnel_broker::instance_with),
        None => tunnel_broker::instance(),
    };
    let broker = match broker {
        Ok(broker) => broker,
        Err(e) => {
            eprintln!("tunnel-broker: {e}");
            return ExitCode::FAILURE;
        }
    };

    let params: Vec<RowValues> = args.params.iter().map(|p| RowValues::from_literal(p)).collect();
    let mut request = QueryRequest::new(args.query, args.mode).params(params);
    if let Some(label) = args.label {
        request = request.label(label);
    }
    if args.no_translate {
        request = request.translation(TranslationMode::ForceOff);
    }

    let outcome = broker.execute_request(request);
    let code = match outcome {
        QueryOutcome::Rows(rows) => {
            for row in &rows.results {
                println!("{}", row.to_json());
            }
            ExitCode::SUCCESS
        }
        QueryOutcome::RowCount(n) => {
            println!("{n}");
            ExitCode::SUCCESS
        }
        QueryOutcome::NoResult => ExitCode::FAILURE,
    };

    if args.status {
        match serde_json::to_string(&broker.status()) {
            Ok(json) => eprintln!("{json}"),
            Err(e) => eprintln!("tunnel-broker: cannot render status: {e}"),
        }
    }
    drop(broker);
    tunnel_broker::shutdown();
    code
}
