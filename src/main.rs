//! CLI tool to expand Cartesian configuration files into test variants.

use std::process::ExitCode;

use cartconf_rs::{Error, Parser};

fn usage() {
    eprintln!("Usage: cartconf [options] <config> [extras...]");
    eprintln!();
    eprintln!("Arguments:");
    eprintln!("  <config>    path to a configuration file");
    eprintln!("  [extras]    zero or more of: key=value, 'only FILTER', 'no FILTER'");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  -c, --contents  treat <config> as the configuration text itself");
    eprintln!("  -v, --verbose   debug logging, full names, and dict contents");
    eprintln!("  -h, --help      show this help");
    eprintln!();
    eprintln!("Example:");
    eprintln!("  cartconf tests.cfg \"only my_set\" \"no qcow2\" arch=x86_64");
}

fn exit_code_for(err: &Error) -> u8 {
    match err {
        Error::Include(_) => 3,
        _ => 2,
    }
}

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().skip(1).collect();

    let mut contents_mode = false;
    let mut verbose = false;
    let mut positionals: Vec<&str> = Vec::new();
    for arg in &args {
        match arg.as_str() {
            "-c" | "--contents" => contents_mode = true,
            "-v" | "--verbose" => verbose = true,
            "-h" | "--help" => {
                usage();
                return ExitCode::SUCCESS;
            }
            other if other.starts_with('-') => {
                eprintln!("Unknown option: {other}");
                usage();
                return ExitCode::from(2);
            }
            other => positionals.push(other),
        }
    }

    if verbose {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug")),
            )
            .with_writer(std::io::stderr)
            .init();
    }

    let Some((config, extras)) = positionals.split_first() else {
        eprintln!("Error: no configuration specified");
        usage();
        return ExitCode::from(2);
    };

    let mut parser = Parser::new();
    let parsed = if contents_mode {
        parser.parse_string(config)
    } else {
        parser.parse_file(config)
    };
    if let Err(e) = parsed {
        eprintln!("{config}: {e}");
        return ExitCode::from(exit_code_for(&e));
    }

    for extra in extras {
        let result = if let Some(expr) = extra.strip_prefix("only ") {
            parser.only_filter(expr.trim())
        } else if let Some(expr) = extra.strip_prefix("no ") {
            parser.no_filter(expr.trim())
        } else if let Some((key, value)) = extra.split_once('=') {
            parser.assign(key.trim(), value.trim())
        } else {
            eprintln!("Unrecognized extra argument: {extra}");
            usage();
            return ExitCode::from(2);
        };
        if let Err(e) = result {
            eprintln!("{extra}: {e}");
            return ExitCode::from(exit_code_for(&e));
        }
    }

    for (count, variant) in parser.variants().enumerate() {
        let variant = match variant {
            Ok(v) => v,
            Err(e) => {
                eprintln!("{e}");
                return ExitCode::from(exit_code_for(&e));
            }
        };
        if verbose {
            println!("dict {:4}:  {}", count + 1, variant.name);
            let mut keys: Vec<String> =
                variant.params.keys().map(|k| k.flat()).collect();
            keys.sort();
            for key in keys {
                let value = variant.params.get(&key).unwrap_or("");
                println!("    {key} = {value}");
            }
        } else {
            println!("dict {:4}:  {}", count + 1, variant.short_name);
        }
    }

    ExitCode::SUCCESS
}
