use anyhow::Result;
use clap::{Arg, Command};

use warren::Config;

#[tokio::main]
async fn main() -> Result<()> {
    pretty_env_logger::formatted_timed_builder()
        .filter_level(log::LevelFilter::Info)
        .parse_env("WARREN_LOG")
        .init();

    let matches = Command::new("warren")
        .about("Authoritative DNS responder terminating an encrypted message tunnel")
        .arg(
            Arg::new("domain")
                .short('d')
                .long("domain")
                .help("Apex domain to answer authoritatively for")
                .required(true),
        )
        .arg(
            Arg::new("bind")
                .short('b')
                .long("bind")
                .help("UDP listen address")
                .default_value("0.0.0.0:53"),
        )
        .get_matches();

    let domain = matches
        .get_one::<String>("domain")
        .expect("domain is a required argument")
        .clone();
    let mut config = Config::new(domain);
    config.bind_addr = matches
        .get_one::<String>("bind")
        .expect("bind has a default")
        .clone();

    warren::tunnel::run(config).await
}
