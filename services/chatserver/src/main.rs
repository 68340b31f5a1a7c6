use clap::{App, Arg};
use parley::config::Config;
use parley::logging;
use std::fs;
use std::process;

pub fn main() {
    let matches = App::new("Chat Server")
        .version("0.1.0")
        .author("Bush Hammer Industries")
        .about("Runs the chatroom server.")
        .arg(
            Arg::with_name("CONFIG_FILE")
                .short("f")
                .long("config-file")
                .takes_value(true)
                .help("Path to the config file"),
        )
        .arg(
            Arg::with_name("PORT")
                .short("p")
                .long("port")
                .takes_value(true)
                .help("Sets the port number"),
        )
        .arg(
            Arg::with_name("MAX_CONNECTIONS")
                .short("m")
                .long("max-connections")
                .takes_value(true)
                .help("Sets the maximum concurrent connections"),
        )
        .arg(
            Arg::with_name("MAX_CHATROOMS")
                .short("c")
                .long("max-chatrooms")
                .takes_value(true)
                .help("Sets the advisory chatroom limit"),
        )
        .arg(
            Arg::with_name("VERBOSE")
                .short("v")
                .long("verbose")
                .help("Turn on debug level messages"),
        )
        .arg(
            Arg::with_name("LOGGING")
                .short("l")
                .long("enable-logging")
                .help("Turn on logging"),
        )
        .get_matches();

    let mut config: Config = match matches.value_of("CONFIG_FILE") {
        Some(path) => serde_json::from_reader(
            fs::File::open(path).expect("Error opening config file"),
        )
        .expect("Error parsing config file"),
        None => Config::default(),
    };

    if let Some(port) = matches.value_of("PORT") {
        config.port = port.parse().expect("Invalid port number");
    }

    if let Some(max_connections) = matches.value_of("MAX_CONNECTIONS") {
        config.max_connections = max_connections
            .parse()
            .expect("Invalid connection limit");
    }

    if let Some(max_chatrooms) = matches.value_of("MAX_CHATROOMS") {
        config.max_chatrooms = max_chatrooms.parse().expect("Invalid chatroom limit");
    }

    if matches.is_present("VERBOSE") {
        config.verbose = true;
    }

    if matches.is_present("LOGGING") {
        config.logging_enabled = true;
    }

    let logger = if config.logging_enabled || config.verbose {
        logging::init(config.verbose)
    } else {
        logging::discard()
    };

    logging::info!(logger, "starting chat server"; "port" => config.port);

    if let Err(err) = parley::serve(config, &logger) {
        logging::error!(logger, "server terminated"; "error" => ?err);
        process::exit(1);
    }
}
