//! An echo bot that just repeats stuff sent to it (either in a channel or as PRIVMSG).

use libminnow_client::{Client, Event, ServerConfig};
use libminnow_common::ChanNameRef;

use std::process::exit;

fn main() {
    // echo <nick> <server> <port> [<chan_1> ... <chan_N>]
    let mut args_vec: Vec<String> = std::env::args().collect();
    if args_vec.len() < 4 {
        show_usage();
        exit(1);
    }

    let nick = args_vec.remove(1);
    let host = args_vec.remove(1);
    let port_str = args_vec.remove(1);
    let port = match port_str.parse::<u16>() {
        Ok(port) => port,
        Err(err) => {
            println!("Can't parse port: {:?}", port_str);
            println!("{}", err);
            exit(1);
        }
    };

    let autojoin = args_vec[1..]
        .iter()
        .map(|c| ChanNameRef::new(c).to_owned())
        .collect::<Vec<_>>();

    let cfg = ServerConfig {
        host,
        port,
        tls: false,
        username: nick.clone(),
        realname: "minnow echo bot".to_owned(),
        nick,
        pass: None,
        autojoin,
    };

    println!("{:?}", cfg);

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    let local = tokio::task::LocalSet::new();
    local.block_on(&runtime, echo_bot_task(cfg));
}

fn show_usage() {
    println!("echo <nick> <server> <port> [<chan_1> .. <chan_N>]");
}

static NICK_SEP: [&str; 4] = [": ", ", ", ":", ","];

async fn echo_bot_task(cfg: ServerConfig) {
    let (mut client, mut rcv_ev) = Client::new(cfg);

    while let Some(ev) = rcv_ev.recv().await {
        println!("Client event: {:?}", ev);
        if let Event::ReceivedPrivmsg {
            sender,
            recipient,
            msg,
        } = ev
        {
            let our_nick = client.get_nick();
            let echo_msg = if recipient == our_nick {
                // Message is a PRIVMSG to us, just echo the whole message to the sender
                Some((sender, msg))
            } else {
                // Message was sent to a channel. Only echo if it's directed at us
                if msg.starts_with(&our_nick) {
                    let mut msg = &msg[our_nick.len()..];
                    for nick_sep in NICK_SEP.iter() {
                        if msg.starts_with(nick_sep) {
                            msg = &msg[nick_sep.len()..];
                            break;
                        }
                    }
                    Some((recipient, msg.to_owned()))
                } else {
                    None
                }
            };

            if let Some((target, msg)) = echo_msg {
                client.privmsg(&target, &msg, false);
            }
        }
    }
}
