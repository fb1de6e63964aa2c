use clap::{Arg, Command};
use log::LevelFilter;
use mailsentry::message::{RawAttachment, RawMail, RawMimePart};
use mailsentry::nlp::NoopClassifier;
use mailsentry::{AnalysisPipeline, Config};
use std::process;

#[tokio::main]
async fn main() {
    let matches = Command::new("mailsentry")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Email threat analysis: spam scoring, linguistic threat detection, and attachment authenticity checks")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .default_value(Config::default_path()),
        )
        .arg(
            Arg::new("generate-config")
                .long("generate-config")
                .value_name("FILE")
                .help("Write a default configuration file and exit")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("test-config")
                .long("test-config")
                .help("Validate the configuration and exit")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("scan")
                .long("scan")
                .value_name("FILE")
                .help("Analyze a raw message file and print the report")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Enable verbose logging")
                .action(clap::ArgAction::SetTrue),
        )
        .get_matches();

    let log_level = if matches.get_flag("verbose") {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    env_logger::Builder::from_default_env()
        .filter_level(log_level)
        .init();

    if let Some(path) = matches.get_one::<String>("generate-config") {
        if let Err(e) = generate_default_config(path) {
            eprintln!("Error generating configuration: {e}");
            process::exit(1);
        }
        return;
    }

    let config_path = matches.get_one::<String>("config").unwrap();
    let config = match load_config(config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            process::exit(1);
        }
    };

    if matches.get_flag("test-config") {
        println!("Configuration {} is valid", config_path);
        return;
    }

    if let Some(mail_path) = matches.get_one::<String>("scan") {
        if let Err(e) = scan_file(&config, mail_path).await {
            eprintln!("Error scanning {mail_path}: {e}");
            process::exit(1);
        }
        return;
    }

    eprintln!("Nothing to do; use --scan, --test-config, or --generate-config");
    process::exit(2);
}

fn generate_default_config(path: &str) -> anyhow::Result<()> {
    let yaml = Config::default().to_yaml()?;
    std::fs::write(path, yaml)?;
    println!("Default configuration written to {path}");
    Ok(())
}

fn load_config(path: &str) -> anyhow::Result<Config> {
    let config = if std::path::Path::new(path).exists() {
        Config::load_from_file(path)?
    } else {
        log::warn!("configuration file {} not found, using defaults", path);
        Config::default()
    };
    config.validate()?;
    Ok(config)
}

async fn scan_file(config: &Config, path: &str) -> anyhow::Result<()> {
    let content = std::fs::read(path)?;
    let pipeline = AnalysisPipeline::new(config, Box::new(NoopClassifier))?;

    if !pipeline.admits_announced_size(content.len() as u64) {
        anyhow::bail!("message of {} bytes exceeds the configured size budget", content.len());
    }

    let raw = parse_mail_file(&content);
    let (report, outcomes) = pipeline.process(raw).await;

    println!(
        "verdict: {} (score {:.2}), {} channel deliveries",
        report.risk_level,
        report.overall_score,
        outcomes.iter().filter(|o| o.delivered).count()
    );
    if log::log_enabled!(log::Level::Debug) {
        println!("{}", serde_json::to_string_pretty(&report)?);
    }
    Ok(())
}

/// Minimal RFC 5322 style parse for files fed via `--scan`: header lines
/// with continuations, a blank separator, and the rest as a plain text body.
/// Real transports hand the core pre-split parts instead.
fn parse_mail_file(content: &[u8]) -> RawMail {
    let text = String::from_utf8_lossy(content);
    let mut headers: Vec<(String, String)> = Vec::new();
    let mut body = String::new();
    let mut in_body = false;

    for line in text.split_inclusive('\n') {
        if in_body {
            body.push_str(line);
            continue;
        }
        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            in_body = true;
            continue;
        }
        if (trimmed.starts_with(' ') || trimmed.starts_with('\t')) && !headers.is_empty() {
            if let Some((_, value)) = headers.last_mut() {
                value.push(' ');
                value.push_str(trimmed.trim_start());
            }
            continue;
        }
        if let Some((name, value)) = trimmed.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }

    RawMail {
        raw_headers: headers,
        body_parts: vec![RawMimePart {
            content_type: "text/plain".to_string(),
            data: body.into_bytes(),
        }],
        attachments: Vec::<RawAttachment>::new(),
        announced_total_size: content.len() as u64,
    }
}
