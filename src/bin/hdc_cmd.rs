use anyhow::{anyhow, bail, Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use clap::{App, AppSettings, Arg, ArgMatches, SubCommand};
use colored::*;
use hdc::auth::{decode_token, encode_token, CommandAuthenticator, CommandEnvelope, TrustedSecret};
use hdc::config::DEFAULT_TOKEN_PREFIX;
use hdc::protocol::Topics;
use hdc::telemetry::unix_time_secs;
use rumqttc::{AsyncClient, Event, MqttOptions, Outgoing, Packet, QoS};
use serde_json::{Map, Value};
use std::time::Duration;

const DEFAULT_BROKER: &str = "localhost";
const DEFAULT_PORT: &str = "1883";
const DEFAULT_MAX_AGE: &str = "10";
const SEND_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() {
    let token_arg = Arg::with_name("token")
        .short("t")
        .long("token")
        .value_name("TOKEN")
        .help("Token holding the signing secret")
        .takes_value(true)
        .required(true);
    let values_arg = Arg::with_name("values")
        .value_name("NAME=VALUE")
        .help("Output values to command")
        .multiple(true)
        .required(true);

    let matches = App::new("hdc-cmd")
        .version(env!("CARGO_PKG_VERSION"))
        .about("🔐 Token and signed-command tool for hdc instances")
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .arg(
            Arg::with_name("prefix")
                .long("prefix")
                .value_name("PREFIX")
                .help("Token prefix")
                .takes_value(true)
                .default_value(DEFAULT_TOKEN_PREFIX)
                .global(true),
        )
        .subcommand(
            SubCommand::with_name("token")
                .about("🔑 Encode a secret as a token")
                .arg(Arg::with_name("secret").value_name("SECRET").required(true))
                .arg(
                    Arg::with_name("base64")
                        .long("base64")
                        .help("SECRET is base64 rather than raw text"),
                ),
        )
        .subcommand(
            SubCommand::with_name("decode")
                .about("🔍 Check a token and show its secret length")
                .arg(Arg::with_name("token").value_name("TOKEN").required(true)),
        )
        .subcommand(
            SubCommand::with_name("sign")
                .about("✍️  Print a signed command pair")
                .arg(token_arg.clone())
                .arg(values_arg.clone()),
        )
        .subcommand(
            SubCommand::with_name("verify")
                .about("✅ Verify a signed command pair")
                .arg(token_arg.clone().multiple(true).number_of_values(1))
                .arg(
                    Arg::with_name("max-age")
                        .long("max-age")
                        .value_name("SECONDS")
                        .help("Accepted clock difference")
                        .takes_value(true)
                        .default_value(DEFAULT_MAX_AGE),
                )
                .arg(Arg::with_name("pair").value_name("PAIR").required(true)),
        )
        .subcommand(
            SubCommand::with_name("send")
                .about("📡 Sign a command and publish it to an instance")
                .arg(token_arg)
                .arg(
                    Arg::with_name("instance")
                        .short("i")
                        .long("instance")
                        .value_name("NAME")
                        .help("Target instance name")
                        .takes_value(true)
                        .required(true),
                )
                .arg(
                    Arg::with_name("broker")
                        .short("b")
                        .long("broker")
                        .value_name("HOST")
                        .takes_value(true)
                        .default_value(DEFAULT_BROKER),
                )
                .arg(
                    Arg::with_name("port")
                        .short("p")
                        .long("port")
                        .value_name("PORT")
                        .takes_value(true)
                        .default_value(DEFAULT_PORT),
                )
                .arg(values_arg),
        )
        .get_matches();

    let prefix = matches.value_of("prefix").unwrap_or(DEFAULT_TOKEN_PREFIX).to_string();
    let result = match matches.subcommand() {
        ("token", Some(sub)) => handle_token(sub, &prefix),
        ("decode", Some(sub)) => handle_decode(sub, &prefix),
        ("sign", Some(sub)) => handle_sign(sub, &prefix),
        ("verify", Some(sub)) => handle_verify(sub, &prefix),
        ("send", Some(sub)) => handle_send(sub, &prefix).await,
        _ => Err(anyhow!("no command given, see --help")),
    };

    if let Err(e) = result {
        eprintln!("{} {}", "❌".red(), format!("{:#}", e).bright_red());
        std::process::exit(1);
    }
}

fn handle_token(matches: &ArgMatches<'_>, prefix: &str) -> Result<()> {
    let secret = matches.value_of("secret").unwrap_or_default();
    let bytes = if matches.is_present("base64") {
        STANDARD.decode(secret).context("secret is not base64")?
    } else {
        secret.as_bytes().to_vec()
    };
    if bytes.is_empty() {
        bail!("secret is empty");
    }
    println!("{}", encode_token(prefix, &bytes));
    Ok(())
}

fn handle_decode(matches: &ArgMatches<'_>, prefix: &str) -> Result<()> {
    let token = matches.value_of("token").unwrap_or_default();
    let secret = decode_token(prefix, token)?;
    println!(
        "{} {} ({} byte secret)",
        "✅".green(),
        "Token is valid".bright_green(),
        secret.as_bytes().len()
    );
    Ok(())
}

fn signing_secret(matches: &ArgMatches<'_>, prefix: &str) -> Result<TrustedSecret> {
    let token = matches.value_of("token").unwrap_or_default();
    decode_token(prefix, token).context("bad signing token")
}

/// `name=value` pairs; values that parse as JSON keep their type.
fn parse_values<'a>(values: impl Iterator<Item = &'a str>) -> Result<Map<String, Value>> {
    let mut body = Map::new();
    for pair in values {
        let (name, value) = pair
            .split_once('=')
            .ok_or_else(|| anyhow!("'{}' is not NAME=VALUE", pair))?;
        let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
        body.insert(name.to_string(), value);
    }
    Ok(body)
}

fn signed_envelope(matches: &ArgMatches<'_>, prefix: &str) -> Result<CommandEnvelope> {
    let secret = signing_secret(matches, prefix)?;
    let body = parse_values(matches.values_of("values").into_iter().flatten())?;
    Ok(CommandEnvelope::sign(body, secret.as_bytes(), unix_time_secs()))
}

fn handle_sign(matches: &ArgMatches<'_>, prefix: &str) -> Result<()> {
    println!("{}", signed_envelope(matches, prefix)?);
    Ok(())
}

fn handle_verify(matches: &ArgMatches<'_>, prefix: &str) -> Result<()> {
    let max_age: u64 = matches
        .value_of("max-age")
        .unwrap_or(DEFAULT_MAX_AGE)
        .parse()
        .context("max-age must be a whole number of seconds")?;
    let tokens: Vec<&str> = matches.values_of("token").into_iter().flatten().collect();
    let authenticator = CommandAuthenticator::from_tokens(prefix, &tokens, Duration::from_secs(max_age));
    if authenticator.is_empty() {
        bail!("none of the tokens is valid");
    }

    let pair = matches.value_of("pair").unwrap_or_default();
    let body = authenticator.authenticate(pair, unix_time_secs())?;
    println!("{} {}", "✅".green(), "Command is authentic".bright_green());
    println!("{}", serde_json::to_string_pretty(&body)?);
    Ok(())
}

async fn handle_send(matches: &ArgMatches<'_>, prefix: &str) -> Result<()> {
    let instance = matches.value_of("instance").unwrap_or_default();
    let broker = matches.value_of("broker").unwrap_or(DEFAULT_BROKER);
    let port: u16 = matches
        .value_of("port")
        .unwrap_or(DEFAULT_PORT)
        .parse()
        .context("port must be a number")?;
    let envelope = signed_envelope(matches, prefix)?;
    let topic = Topics::new(instance).cmd;

    let mut options = MqttOptions::new(format!("hdc-cmd-{}", std::process::id()), broker, port);
    options.set_keep_alive(Duration::from_secs(5));
    let (client, mut eventloop) = AsyncClient::new(options, 10);
    client
        .publish(topic.clone(), QoS::AtLeastOnce, false, envelope.to_string())
        .await?;

    println!("{} {}:{}", "Connecting to".dimmed(), broker, port);
    let delivered = tokio::time::timeout(SEND_TIMEOUT, async {
        loop {
            match eventloop.poll().await? {
                Event::Incoming(Packet::PubAck(_)) => {
                    client.disconnect().await?;
                }
                Event::Outgoing(Outgoing::Disconnect) => return Ok::<_, anyhow::Error>(()),
                _ => {}
            }
        }
    })
    .await
    .map_err(|_| anyhow!("no acknowledgement from {}:{} within {:?}", broker, port, SEND_TIMEOUT))?;
    delivered?;

    println!("{} Command sent to {}", "📡".bright_blue(), topic.bright_cyan());
    Ok(())
}
