//! IRC event handling: drains a client's event stream and renders each event as a line on
//! stdout. Stands in for a full UI; one task per server.

use libminnow_client::Event;

use chrono::Local;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;

pub(crate) async fn task(rcv_ev: mpsc::Receiver<Event>, serv: String) {
    let mut rcv_ev = ReceiverStream::new(rcv_ev);
    while let Some(ev) = rcv_ev.next().await {
        let is_quit = matches!(ev, Event::SelfQuit);
        print_event(&serv, ev);
        if is_quit {
            return;
        }
    }
}

fn print_event(serv: &str, ev: Event) {
    let line = render_event(ev);
    println!("{} [{}] {}", Local::now().format("%H:%M:%S"), serv, line);
}

fn render_event(ev: Event) -> String {
    use Event::*;
    match ev {
        SelfJoined { chan, topic, nicks } => format!(
            "Joined {} ({} users). The topic is: {}",
            chan.display(),
            nicks.len(),
            topic
        ),
        SelfParted { chan } => format!("Left {}.", chan.display()),
        SelfChangedNick { new, .. } => format!("You are now known as {new}."),
        SelfQuit => "Quit.".to_string(),
        UserJoined { nick, chan } => format!("{} joined {}.", nick, chan.display()),
        UserParted { nick, chan, reason } => format!(
            "{} left {}.{}",
            nick,
            chan.display(),
            reason_suffix(reason)
        ),
        UserChangedNick { old, new } => format!("{old} is now known as {new}."),
        UserQuit { nick, reason } => format!("{} quit.{}", nick, reason_suffix(reason)),
        TopicChanged {
            chan,
            setter,
            topic,
        } => format!(
            "{} changed the topic of {}: {}",
            setter,
            chan.display(),
            topic
        ),
        ReceivedPrivmsg {
            sender,
            recipient,
            msg,
        } => format!("{recipient} <{sender}> {msg}"),
        SentPrivmsg { recipient, msg } => format!("{recipient} <you> {msg}"),
        ServerMessage { sender, cmd, args } => format!(
            "-{}- {} {}",
            sender.as_deref().unwrap_or("???"),
            cmd,
            args.join(" ")
        ),
        UnknownMessage { sender, cmd, args } => format!(
            "?{}? {} {}",
            sender.as_deref().unwrap_or("???"),
            cmd,
            args.join(" ")
        ),
        Connectivity { msg, is_error } => {
            if is_error {
                format!("error: {msg}")
            } else {
                msg
            }
        }
        HostChanged { host } => format!("Host changed to {host}."),
    }
}

fn reason_suffix(reason: Option<String>) -> String {
    match reason {
        None => String::new(),
        Some(reason) => format!(" ({reason})"),
    }
}
