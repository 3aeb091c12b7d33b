#![recursion_limit = "512"]
#![allow(clippy::cognitive_complexity)]

//! A multi-server capable IRC client engine. Each [`Client`] owns one logical connection: it
//! parses server lines, tracks channel and membership state, reconnects (and re-joins channels)
//! when the connection goes away, and publishes typed [`Event`]s to the consumer on a channel.

mod pinger;
mod state;
mod stream;
mod utils;

use libminnow_common::{ChanName, ChanNameRef};
pub use libminnow_wire as wire;

use pinger::Pinger;
use state::State;
use stream::{Stream, StreamError};

use futures::future::FutureExt;
use futures::stream::{Fuse, StreamExt};
use futures::{pin_mut, select};
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, WriteHalf};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

#[macro_use]
extern crate log;

//
// Public API
//

/// `Client` waits this many seconds before trying to reconnect after a connection error.
pub const RECONNECT_SECS: u64 = 10;

/// Everything needed to run one server connection. Immutable for the lifetime of a connection
/// attempt; `Client::apply_config` swaps it for the next one.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Server address
    pub host: String,

    /// Server port
    pub port: u16,

    /// Use TLS?
    pub tls: bool,

    /// Nick to register with. The engine does not try alternatives when the nick is taken; the
    /// consumer can issue `Client::nick` after seeing the 433 reply.
    pub nick: String,

    /// User name for connection registration.
    pub username: String,

    /// Real name for connection registration.
    pub realname: String,

    /// Server password. Its presence makes the engine advertise the SASL capability on connect;
    /// the authentication itself is not implemented.
    pub pass: Option<String>,

    /// Channels to automatically join after every (re)connect.
    pub autojoin: Vec<ChanName>,
}

/// Where the engine is in the lifecycle of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnPhase {
    /// Not connected; either the initial state or waiting out the reconnect delay.
    Disconnected,
    /// A socket is being set up.
    Connecting,
    /// Connected, introduction sent, waiting for the end of the MOTD.
    Registering,
    /// Fully registered; autojoin has been replayed.
    Registered,
    /// A QUIT is on its way out.
    Quitting,
    /// The engine has stopped for good.
    Closed,
}

/// IRC client events. Published by `Client` to the consumer via a channel, in the order the
/// server lines arrive, except that `SelfJoined` waits for the nick list to be complete.
#[derive(Debug, Clone)]
pub enum Event {
    /// We joined a channel and the server finished listing who's in it.
    SelfJoined {
        chan: ChanName,
        topic: String,
        nicks: Vec<String>,
    },
    /// We left a channel.
    SelfParted { chan: ChanName },
    /// The server acknowledged our nick change.
    SelfChangedNick { old: String, new: String },
    /// The connection is done, either because the QUIT went out or because `quit` was called
    /// while disconnected. Always the last event.
    SelfQuit,
    /// Someone joined a channel we're in.
    UserJoined { nick: String, chan: ChanName },
    /// Someone left a channel we're in.
    UserParted {
        nick: String,
        chan: ChanName,
        reason: Option<String>,
    },
    /// Someone in one of our channels changed their nick.
    UserChangedNick { old: String, new: String },
    /// Someone in one of our channels quit.
    UserQuit {
        nick: String,
        reason: Option<String>,
    },
    /// A channel topic was changed.
    TopicChanged {
        chan: ChanName,
        setter: String,
        topic: String,
    },
    /// A PRIVMSG to a channel we're in, or directly to us (`recipient` is our nick then).
    ReceivedPrivmsg {
        sender: String,
        recipient: String,
        msg: String,
    },
    /// A PRIVMSG of ours was actually written to the socket, not merely queued.
    SentPrivmsg { recipient: String, msg: String },
    /// A message from the server that has no dedicated event.
    ServerMessage {
        sender: Option<String>,
        cmd: String,
        args: Vec<String>,
    },
    /// A message from a user that has no dedicated event.
    UnknownMessage {
        sender: Option<String>,
        cmd: String,
        args: Vec<String>,
    },
    /// Connection progress and failures, as human-readable one-liners.
    Connectivity { msg: String, is_error: bool },
    /// The configured host changed (via `Client::apply_config`).
    HostChanged { host: String },
}

/// An outbound frame: a complete IRC line (including the trailing "\r\n"), optionally tagged with
/// an event to publish once the line is actually written to the socket.
#[derive(Debug)]
pub(crate) struct Outgoing {
    pub(crate) msg: String,
    pub(crate) done: Option<Event>,
}

impl From<String> for Outgoing {
    fn from(msg: String) -> Outgoing {
        Outgoing { msg, done: None }
    }
}

/// IRC client.
#[derive(Clone)]
pub struct Client {
    /// Channel to send commands to the main loop.
    msg_chan: mpsc::Sender<Cmd>,

    /// Host this client was created for, shown to the user to identify the connection.
    serv_host: String,

    /// Reference to the state, to be able to provide methods like `get_nick` and
    /// `get_chan_nicks`.
    state: State,
}

impl Client {
    /// Create a new client and start its tasks on the current `LocalSet`. Returns the client
    /// handle and the event stream; the stream ends after `Event::SelfQuit`.
    pub fn new(cfg: ServerConfig) -> (Client, mpsc::Receiver<Event>) {
        connect(cfg)
    }

    /// Reconnect to the server, possibly using a new port.
    pub fn reconnect(&mut self, port: Option<u16>) {
        debug!("reconnect cmd received, port: {:?}", port);
        self.send_cmd(Cmd::Reconnect(port));
    }

    /// Swap the server configuration and reconnect with it. Publishes `Event::HostChanged` when
    /// the host is different from the current one.
    pub fn apply_config(&mut self, cfg: ServerConfig) {
        self.send_cmd(Cmd::ApplyConfig(Box::new(cfg)));
    }

    /// Get host name of this connection.
    pub fn get_serv_name(&self) -> &str {
        &self.serv_host
    }

    /// Get current nick. Starts as the configured nick, follows server-acknowledged nick
    /// changes.
    // FIXME: This allocates a String
    pub fn get_nick(&self) -> String {
        self.state.get_nick()
    }

    /// Send a message directly to the server. "\r\n" suffix is added by this method.
    pub fn raw_msg(&mut self, msg: &str) {
        self.send_cmd(Cmd::Msg(format!("{}\r\n", msg).into()));
    }

    /// Split a privmsg to multiple messages so that each message is, when the hostname and nick
    /// prefix added by the server, fits in one IRC message.
    ///
    /// `extra_len`: Size (in bytes) for a prefix/suffix etc. that'll be added to each line.
    pub fn split_privmsg<'a>(
        &self,
        extra_len: usize,
        msg: &'a str,
    ) -> impl Iterator<Item = &'a str> {
        // Max msg len calculation adapted from hexchat
        // (src/common/outbound.c:split_up_text)
        let mut max = wire::MAX_MSG_LEN;
        max -= 3; // :, !, @
        max -= 13; // " PRIVMSG ", " ", :, \r, \n
        max -= self.get_nick().len();
        max -= extra_len;
        match self.state.get_usermask() {
            None => {
                max -= 9; // max username
                max -= 64; // max possible hostname (63) + '@'
            }
            Some(ref usermask) => {
                max -= usermask.len();
            }
        }

        assert!(max > 0);

        utils::split_iterator(msg, max)
    }

    /// Send a privmsg. Messages longer than one IRC line allows are split; every line that makes
    /// it onto the wire is acknowledged with an `Event::SentPrivmsg`.
    pub fn privmsg(&mut self, target: &str, msg: &str, is_action: bool) {
        let wire_fn = if is_action {
            wire::action
        } else {
            wire::privmsg
        };
        let extra_len = target.len() + if is_action { 9 } else { 0 };
        for chunk in self.split_privmsg(extra_len, msg) {
            self.send_cmd(Cmd::Msg(Outgoing {
                msg: wire_fn(target, chunk),
                done: Some(Event::SentPrivmsg {
                    recipient: target.to_owned(),
                    msg: chunk.to_owned(),
                }),
            }));
        }
    }

    /// Join a channel. The `SelfJoined` event follows when the server finished the NAMES list
    /// for it.
    pub fn join(&mut self, chan: &ChanNameRef) {
        self.send_cmd(Cmd::Msg(wire::join(chan).into()));
    }

    /// Leave a channel, with an optional reason.
    pub fn part(&mut self, chan: &ChanNameRef, reason: Option<String>) {
        self.send_cmd(Cmd::Msg(wire::part(chan, reason).into()));
    }

    /// Set away status. `None` means not away.
    pub fn away(&mut self, msg: Option<&str>) {
        self.state.set_away(msg);
        self.send_cmd(Cmd::Msg(wire::away(msg).into()));
    }

    /// Change nick. This may fail (ERR_NICKNAMEINUSE) so wait for confirmation (a NICK message
    /// back from the server, with the old nick as prefix).
    pub fn nick(&mut self, new_nick: &str) {
        self.send_cmd(Cmd::Msg(wire::nick(new_nick).into()));
    }

    /// Change a channel topic.
    pub fn topic(&mut self, chan: &ChanNameRef, topic: &str) {
        self.send_cmd(Cmd::Msg(wire::topic(chan, topic).into()));
    }

    /// Send a QUIT message to the server, with optional "reason". This stops the client: a
    /// single `Event::SelfQuit` is published (promptly even when disconnected) and then the
    /// event stream ends. Idempotent.
    pub fn quit(&mut self, reason: Option<String>) {
        debug!("quit cmd received");
        self.send_cmd(Cmd::Quit(reason));
    }

    /// Get all nicks in a channel, sorted.
    pub fn get_chan_nicks(&self, chan: &ChanNameRef) -> Vec<String> {
        self.state.get_chan_nicks(chan)
    }

    fn send_cmd(&mut self, cmd: Cmd) {
        // The channel is closed when the main loop returned after a quit; commands after that
        // have nowhere to go.
        if let Err(err) = self.msg_chan.try_send(cmd) {
            debug!("client command dropped: {}", err);
        }
    }
}

//
// End of public API
//

#[derive(Debug)]
enum Cmd {
    /// Put this frame on the send pipeline. Frames are complete IRC lines (including the
    /// trailing "\r\n"). Silently dropped while disconnected.
    Msg(Outgoing),
    /// Reconnect to the server, possibly using a new port.
    Reconnect(Option<u16>),
    /// Swap the server config and reconnect.
    ApplyConfig(Box<ServerConfig>),
    /// Close the connection. This sends a QUIT message to the server (with optional "reason"),
    /// publishes `Event::SelfQuit` and stops all tasks.
    Quit(Option<String>),
}

type CmdStream = Fuse<ReceiverStream<Cmd>>;

fn connect(cfg: ServerConfig) -> (Client, mpsc::Receiver<Event>) {
    let serv_host = cfg.host.clone();

    // Channel for returning IRC events to the consumer.
    let (snd_ev, rcv_ev) = mpsc::channel::<Event>(100);

    // Channel for commands from the consumer.
    let (snd_cmd, rcv_cmd) = mpsc::channel::<Cmd>(100);

    let state = State::new(cfg.clone());

    let task = main_loop(cfg.port, state.clone(), snd_ev, rcv_cmd);
    tokio::task::spawn_local(task);

    (
        Client {
            msg_chan: snd_cmd,
            serv_host,
            state,
        },
        rcv_ev,
    )
}

async fn main_loop(
    initial_port: u16,
    state: State,
    mut snd_ev: mpsc::Sender<Event>,
    rcv_cmd: mpsc::Receiver<Cmd>,
) {
    let mut rcv_cmd = ReceiverStream::new(rcv_cmd).fuse();

    // We allow changing ports when reconnecting, so `mut`
    let mut port = initial_port;

    // Whether to wait before trying to (re)connect
    let mut wait = false;

    // Main loop just tries to (re)connect
    'connect: loop {
        if wait {
            state.set_phase(ConnPhase::Disconnected);
            match wait_(&mut rcv_cmd).await {
                TaskResult::Done(()) => {}
                TaskResult::Reconnect(mb_port) => {
                    port = mb_port.unwrap_or(port);
                }
                TaskResult::Apply(cfg) => {
                    port = cfg.port;
                    state.apply_config(*cfg, &mut snd_ev);
                }
                TaskResult::Quit => {
                    quit_offline(&state, &mut snd_ev).await;
                    return;
                }
                TaskResult::Return => {
                    return;
                }
            }
            wait = false;
        }

        let (host, tls) = state.conn_info();

        send_connectivity(
            &mut snd_ev,
            format!("Connecting to {} port {}...", host, port),
            false,
        )
        .await;
        state.set_phase(ConnPhase::Connecting);

        //
        // Resolve the address
        //

        debug!("Resolving address");

        let addrs = match resolve_addr(host.clone(), port, &mut rcv_cmd).await {
            TaskResult::Done(Ok(addrs)) => {
                debug!("Address resolved: {:?}", addrs);
                addrs
            }
            TaskResult::Done(Err(err)) => {
                debug!("resolve_addr: {:?}", err);
                send_connectivity(
                    &mut snd_ev,
                    format!(
                        "Cannot connect (reconnecting in {} seconds): {}",
                        RECONNECT_SECS, err
                    ),
                    true,
                )
                .await;
                wait = true;
                continue;
            }
            TaskResult::Reconnect(mb_port) => {
                port = mb_port.unwrap_or(port);
                wait = false;
                continue;
            }
            TaskResult::Apply(cfg) => {
                port = cfg.port;
                state.apply_config(*cfg, &mut snd_ev);
                wait = false;
                continue;
            }
            TaskResult::Quit => {
                quit_offline(&state, &mut snd_ev).await;
                return;
            }
            TaskResult::Return => {
                return;
            }
        };

        //
        // Establish the connection
        //

        let stream = match try_connect(addrs, &host, tls, &mut rcv_cmd).await {
            TaskResult::Done(Ok(stream)) => stream,
            TaskResult::Done(Err(err)) => {
                send_connectivity(
                    &mut snd_ev,
                    format!(
                        "Cannot connect (reconnecting in {} seconds): {}",
                        RECONNECT_SECS, err
                    ),
                    true,
                )
                .await;
                wait = true;
                continue;
            }
            TaskResult::Reconnect(mb_port) => {
                port = mb_port.unwrap_or(port);
                wait = false;
                continue;
            }
            TaskResult::Apply(cfg) => {
                port = cfg.port;
                state.apply_config(*cfg, &mut snd_ev);
                wait = false;
                continue;
            }
            TaskResult::Quit => {
                quit_offline(&state, &mut snd_ev).await;
                return;
            }
            TaskResult::Return => {
                return;
            }
        };

        let (mut read_half, write_half) = tokio::io::split(stream);

        debug!("Connected");

        //
        // Do the business
        //

        // Channel to the sender task. Frames queued here are written to the socket in order;
        // frames with a completion event publish it after a successful write.
        let (mut snd_msg, rcv_msg) = mpsc::channel::<Outgoing>(100);

        // Reset the per-connection state and introduce ourselves
        state.reset();
        state.introduce(&mut snd_msg);
        state.set_phase(ConnPhase::Registering);

        // Spawn a task for outgoing messages.
        tokio::task::spawn_local(sender_task(write_half, rcv_msg, snd_ev.clone()));

        // Spawn pinger task
        let (mut pinger, rcv_ping_evs) = Pinger::new();
        let mut rcv_ping_evs = ReceiverStream::new(rcv_ping_evs).fuse();

        let mut parse_buf: Vec<u8> = Vec::with_capacity(1024);

        loop {
            let mut read_buf: [u8; 1024] = [0; 1024];

            select! {
                cmd = rcv_cmd.next() => {
                    match cmd {
                        None => {
                            debug!("main loop: command channel terminated from the other end");
                            // That's OK, rcv_cmd will never be ready again
                        }
                        Some(Cmd::Msg(out)) => {
                            if snd_msg.try_send(out).is_err() {
                                warn!("send queue full, dropping outbound frame");
                            }
                        }
                        Some(Cmd::Reconnect(mb_port)) => {
                            if let Some(new_port) = mb_port {
                                port = new_port;
                            }
                            wait = false;
                            continue 'connect;
                        }
                        Some(Cmd::ApplyConfig(cfg)) => {
                            port = cfg.port;
                            state.apply_config(*cfg, &mut snd_ev);
                            wait = false;
                            continue 'connect;
                        }
                        Some(Cmd::Quit(reason)) => {
                            state.set_phase(ConnPhase::Quitting);
                            if snd_msg
                                .try_send(Outgoing {
                                    msg: wire::quit(reason),
                                    done: Some(Event::SelfQuit),
                                })
                                .is_err()
                            {
                                // Queue gone or full; still complete the quit
                                let _ = snd_ev.send(Event::SelfQuit).await;
                            }
                            // Returning drops the read half; the sender task drains the queue,
                            // writes the QUIT and publishes `SelfQuit` before closing the socket.
                            return;
                        }
                    }
                }
                // It's fine to fuse() the read here because we restart the main loop with a new
                // stream when this one ends (either with an error, or when it's closed on the
                // remote end), so we never poll it again after it terminates.
                bytes = read_half.read(&mut read_buf).fuse() => {
                    match bytes {
                        Err(io_err) => {
                            debug!("main loop: error when reading from socket: {:?}", io_err);
                            send_connectivity(
                                &mut snd_ev,
                                format!(
                                    "Error while receiving (reconnecting in {} seconds): {}",
                                    RECONNECT_SECS, io_err
                                ),
                                true,
                            )
                            .await;
                            wait = true;
                            continue 'connect;
                        }
                        Ok(0) => {
                            debug!("main loop: read 0 bytes");
                            send_connectivity(
                                &mut snd_ev,
                                "Server closed the connection".to_string(),
                                true,
                            )
                            .await;
                            wait = true;
                            continue 'connect;
                        }
                        Ok(bytes) => {
                            parse_buf.extend_from_slice(&read_buf[0..bytes]);
                            while let Some(mb_msg) = wire::parse_irc_msg(&mut parse_buf) {
                                match mb_msg {
                                    Err(err) => {
                                        // A bad line must not take the loop down
                                        warn!("discarding malformed line: {}", err);
                                    }
                                    Ok(msg) => {
                                        debug!("parsed msg: {:?}", msg);
                                        pinger.reset();
                                        state.update(msg, &mut snd_ev, &mut snd_msg);
                                    }
                                }
                            }
                        }
                    }
                }
                ping_ev = rcv_ping_evs.next() => {
                    match ping_ev {
                        None => {
                            debug!("Ping task terminated unexpectedly???");
                        }
                        Some(pinger::Event::SendPing) => {
                            state.send_ping(&mut snd_msg);
                        }
                        Some(pinger::Event::Disconnect) => {
                            send_connectivity(
                                &mut snd_ev,
                                format!(
                                    "Ping timeout (reconnecting in {} seconds)",
                                    RECONNECT_SECS
                                ),
                                true,
                            )
                            .await;
                            wait = true;
                            continue 'connect;
                        }
                    }
                }
            }
        }
    }
}

/// Drain the send queue onto the socket. Completion events are published after the write; a
/// `SelfQuit` completion also ends the task (and with it the connection, as the write half is
/// dropped). Write errors drop the frame; the main loop notices the dead socket on its read side
/// and reconnects.
async fn sender_task(
    mut write_half: WriteHalf<Stream>,
    mut rcv_msg: mpsc::Receiver<Outgoing>,
    snd_ev: mpsc::Sender<Event>,
) {
    while let Some(Outgoing { msg, done }) = rcv_msg.recv().await {
        let msg = if msg.len() > wire::MAX_MSG_LEN {
            warn!("outbound line too long ({} bytes), truncating", msg.len());
            wire::enforce_max_len(msg)
        } else {
            msg
        };

        if let Err(io_err) = write_half.write_all(msg.as_bytes()).await {
            warn!("IO error when writing: {:?}", io_err);
            if let Some(ev @ Event::SelfQuit) = done {
                // The connection is already gone; the quit still completes locally.
                let _ = snd_ev.send(ev).await;
                return;
            }
            continue;
        }

        if let Some(ev) = done {
            let is_quit = matches!(ev, Event::SelfQuit);
            if snd_ev.send(ev).await.is_err() {
                return;
            }
            if is_quit {
                return;
            }
        }
    }
}

/// `quit` was called while there's no connection: no QUIT line can go out, but the quit still
/// completes promptly.
async fn quit_offline(state: &State, snd_ev: &mut mpsc::Sender<Event>) {
    state.set_phase(ConnPhase::Quitting);
    let _ = snd_ev.send(Event::SelfQuit).await;
    state.set_phase(ConnPhase::Closed);
}

async fn send_connectivity(snd_ev: &mut mpsc::Sender<Event>, msg: String, is_error: bool) {
    let _ = snd_ev.send(Event::Connectivity { msg, is_error }).await;
}

enum TaskResult<A> {
    Done(A),
    Return,
    Quit,
    Reconnect(Option<u16>),
    Apply(Box<ServerConfig>),
}

/// What a command means while there's no connection to speak to. Outbound frames are dropped
/// silently here; this is what keeps a dead server from ever stalling the consumer.
fn handle_cmd_offline<A>(cmd: Option<Cmd>) -> Option<TaskResult<A>> {
    match cmd {
        None => {
            // Channel closed, return from the main loop
            Some(TaskResult::Return)
        }
        Some(Cmd::Msg(out)) => {
            debug!("dropping outbound frame while disconnected: {:?}", out.msg);
            None
        }
        Some(Cmd::Reconnect(mb_port)) => Some(TaskResult::Reconnect(mb_port)),
        Some(Cmd::ApplyConfig(cfg)) => Some(TaskResult::Apply(cfg)),
        Some(Cmd::Quit(_)) => Some(TaskResult::Quit),
    }
}

async fn wait_(rcv_cmd: &mut CmdStream) -> TaskResult<()> {
    let delay = tokio::time::sleep(Duration::from_secs(RECONNECT_SECS)).fuse();
    pin_mut!(delay);

    loop {
        select! {
            () = delay => {
                return TaskResult::Done(());
            }
            cmd = rcv_cmd.next() => {
                if let Some(ret) = handle_cmd_offline(cmd) {
                    return ret;
                }
            }
        }
    }
}

async fn resolve_addr(
    host: String,
    port: u16,
    rcv_cmd: &mut CmdStream,
) -> TaskResult<Result<Vec<SocketAddr>, std::io::Error>> {
    let mut addr_iter_task =
        tokio::task::spawn_blocking(move || (host.as_str(), port).to_socket_addrs()).fuse();

    loop {
        select! {
            addr_iter = addr_iter_task => {
                match addr_iter {
                    Err(join_err) => {
                        return TaskResult::Done(Err(std::io::Error::new(
                            std::io::ErrorKind::Other,
                            join_err,
                        )));
                    }
                    Ok(Err(io_err)) => {
                        return TaskResult::Done(Err(io_err));
                    }
                    Ok(Ok(addr_iter)) => {
                        return TaskResult::Done(Ok(addr_iter.collect()));
                    }
                }
            }
            cmd = rcv_cmd.next() => {
                if let Some(ret) = handle_cmd_offline(cmd) {
                    return ret;
                }
            }
        }
    }
}

async fn try_connect(
    addrs: Vec<SocketAddr>,
    host: &str,
    use_tls: bool,
    rcv_cmd: &mut CmdStream,
) -> TaskResult<Result<Stream, StreamError>> {
    let connect_task = async move {
        let mut last_err: Option<StreamError> = None;
        for addr in addrs {
            debug!("Connecting to {}", addr);
            let mb_stream = if use_tls {
                Stream::new_tls(addr, host).await
            } else {
                Stream::new_tcp(addr).await
            };
            match mb_stream {
                Err(err) => {
                    debug!("Connect failed: {}", err);
                    last_err = Some(err);
                }
                Ok(stream) => {
                    return Ok(stream);
                }
            }
        }

        Err(last_err.unwrap_or_else(|| {
            StreamError::IoError(std::io::Error::new(
                std::io::ErrorKind::AddrNotAvailable,
                "host did not resolve to any address",
            ))
        }))
    };

    let connect_task = connect_task.fuse();
    pin_mut!(connect_task);

    loop {
        select! {
            stream = connect_task => {
                return TaskResult::Done(stream);
            }
            cmd = rcv_cmd.next() => {
                if let Some(ret) = handle_cmd_offline(cmd) {
                    return ret;
                }
            }
        }
    }
}
