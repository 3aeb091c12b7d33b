mod cli;
mod config;
mod conn;
mod debug_logging;

use libminnow_client::{Client, ServerConfig};
use libminnow_common::ChanNameRef;

use std::path::PathBuf;
use std::process::exit;

fn main() {
    let cli::Args {
        servers: server_args,
        config_path,
    } = cli::parse();
    let config_path = config_path.unwrap_or_else(config::get_config_path);
    if config_path.is_dir() {
        println!("The config path is a directory.");
        exit(1);
    } else if !config_path.is_file() {
        config::generate_default_config(&config_path);
    } else {
        match config::parse_config(&config_path) {
            Err(err) => {
                println!("Can't parse config file:");
                println!("{}", err);
                exit(1);
            }
            Ok(config) => {
                let config_errors = config.validate();
                if !config_errors.is_empty() {
                    println!(
                        "Config file error{}:",
                        if config_errors.len() > 1 { "s" } else { "" }
                    );
                    for error in config_errors {
                        println!("- {}", error);
                    }
                    exit(1);
                }

                let config::Config { servers, log_dir } = config;

                let servers = if !server_args.is_empty() {
                    // Connect only to servers that match at least one of the given patterns
                    servers
                        .into_iter()
                        .filter(|s| server_args.iter().any(|arg| s.host.contains(arg)))
                        .collect()
                } else {
                    servers
                };
                run(servers, log_dir)
            }
        }
    }
}

const DEBUG_LOG_FILE: &str = "minnow_debug_logs.txt";

fn run(servers: Vec<config::Server>, log_dir: Option<PathBuf>) {
    let debug_log_file = match log_dir {
        Some(log_dir) => log_dir.join(DEBUG_LOG_FILE),
        None => DEBUG_LOG_FILE.into(),
    };
    debug_logging::init(debug_log_file);

    // One task for each client, one task for printing its events
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    let local = tokio::task::LocalSet::new();

    local.block_on(&runtime, async move {
        let mut clients: Vec<Client> = Vec::with_capacity(servers.len());
        let mut conn_tasks = Vec::with_capacity(servers.len());

        for server in servers {
            let autojoin = server
                .join
                .iter()
                .map(|c| ChanNameRef::new(c).to_owned())
                .collect();
            let cfg = ServerConfig {
                host: server.host,
                port: server.port,
                tls: server.tls,
                username: server.username.unwrap_or_else(|| server.nick.clone()),
                nick: server.nick,
                realname: server.realname,
                pass: server.pass,
                autojoin,
            };

            let (client, rcv_ev) = Client::new(cfg);
            let serv_name = client.get_serv_name().to_owned();

            // Spawn a task to handle connection events
            conn_tasks.push(tokio::task::spawn_local(conn::task(rcv_ev, serv_name)));
            clients.push(client);
        }

        // Ctrl-C sends a QUIT to every server; the event tasks end once `SelfQuit` comes back.
        tokio::task::spawn_local(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                for client in clients.iter_mut() {
                    client.quit(None);
                }
            }
        });

        for task in conn_tasks {
            let _ = task.await;
        }
    });
}
