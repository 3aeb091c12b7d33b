#![allow(clippy::zero_prefixed_literal)]

//! The per-server protocol state machine: tracks the current nick, joined channels and their
//! members, collects NAMES replies between a self-JOIN and RPL_ENDOFNAMES, and turns server lines
//! into the typed events published to the consumer.

use crate::utils;
use crate::{ConnPhase, Event, Outgoing, ServerConfig};
use libminnow_common::{ChanName, ChanNameRef, Nick, NickRef};
use libminnow_wire as wire;
use libminnow_wire::{Msg, Pfx};

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use tokio::sync::mpsc::Sender;

/// Topic text published with a join when the server didn't send one.
const NO_TOPIC: &str = "(no topic)";

#[derive(Clone)]
pub(crate) struct State {
    inner: Rc<RefCell<StateInner>>,
}

impl State {
    pub(crate) fn new(cfg: ServerConfig) -> State {
        State {
            inner: Rc::new(RefCell::new(StateInner::new(cfg))),
        }
    }

    pub(crate) fn reset(&self) {
        self.inner.borrow_mut().reset()
    }

    pub(crate) fn send_ping(&self, snd_msg: &mut Sender<Outgoing>) {
        self.inner.borrow_mut().send_ping(snd_msg)
    }

    pub(crate) fn update(
        &self,
        msg: Msg,
        snd_ev: &mut Sender<Event>,
        snd_msg: &mut Sender<Outgoing>,
    ) {
        self.inner.borrow_mut().update(msg, snd_ev, snd_msg);
    }

    pub(crate) fn introduce(&self, snd_msg: &mut Sender<Outgoing>) {
        self.inner.borrow_mut().introduce(snd_msg)
    }

    pub(crate) fn apply_config(&self, cfg: ServerConfig, snd_ev: &mut Sender<Event>) {
        self.inner.borrow_mut().apply_config(cfg, snd_ev)
    }

    /// Host and TLS flag for the next connection attempt.
    pub(crate) fn conn_info(&self) -> (String, bool) {
        let inner = self.inner.borrow();
        (inner.cfg.host.clone(), inner.cfg.tls)
    }

    pub(crate) fn set_phase(&self, phase: ConnPhase) {
        self.inner.borrow_mut().phase = phase;
    }

    // FIXME: This allocates a new String
    pub(crate) fn get_nick(&self) -> String {
        self.inner.borrow().current_nick.clone()
    }

    pub(crate) fn get_usermask(&self) -> Option<String> {
        self.inner.borrow().usermask.clone()
    }

    pub(crate) fn set_away(&self, msg: Option<&str>) {
        self.inner.borrow_mut().away_status = msg.map(str::to_owned);
    }

    pub(crate) fn get_chan_nicks(&self, chan: &ChanNameRef) -> Vec<String> {
        self.inner.borrow().get_chan_nicks(chan)
    }
}

struct StateInner {
    /// The nick as the server currently knows it. Starts as the configured nick, updated when the
    /// server acknowledges a NICK change of ours.
    current_nick: String,

    /// Channels to join after every (re)connect, in the order the user gave them. A successful
    /// join of a new channel appends here, leaving a channel removes it.
    autojoin: Vec<ChanName>,

    /// Channels we're currently in. A `Vec` rather than a map to keep the user's join order;
    /// lookups go through the case-folded `ChanName` equality.
    chans: Vec<Chan>,

    /// Partial joins: servers reply to a JOIN with RPL_NAMREPLY lines (and sometimes a topic)
    /// followed by RPL_ENDOFNAMES. The fragments are collected here and the join event is
    /// published when RPL_ENDOFNAMES arrives.
    joins_in_progress: HashMap<ChanName, JoinInProgress>,

    /// Where we are in the lifecycle of the current connection attempt.
    phase: ConnPhase,

    /// Away reason if away mode is on. `None` otherwise.
    away_status: Option<String>,

    /// servername to be used in PING messages. Read from 002 RPL_YOURHOST. `None` until 002.
    servername: Option<String>,

    /// Our usermask given by the server. Used to compute how much of the 512-byte message budget
    /// the server-added prefix takes.
    usermask: Option<String>,

    /// Server configuration
    cfg: ServerConfig,
}

struct Chan {
    /// Name of the channel, with the casing it was first seen with.
    name: ChanName,
    /// Channel topic, if any was seen.
    topic: Option<String>,
    /// Set of nicknames in channel.
    nicks: HashSet<Nick>,
}

struct JoinInProgress {
    topic: Option<String>,
    nicks: Vec<String>,
}

impl StateInner {
    fn new(cfg: ServerConfig) -> StateInner {
        StateInner {
            current_nick: cfg.nick.clone(),
            autojoin: cfg.autojoin.clone(),
            chans: Vec::new(),
            joins_in_progress: HashMap::new(),
            phase: ConnPhase::Disconnected,
            away_status: None,
            servername: None,
            usermask: None,
            cfg,
        }
    }

    /// Forget everything scoped to a single connection attempt. The autojoin list survives so the
    /// channels can be rejoined.
    fn reset(&mut self) {
        self.current_nick = self.cfg.nick.clone();
        self.chans.clear();
        self.joins_in_progress.clear();
        self.servername = None;
        self.usermask = None;
    }

    fn apply_config(&mut self, cfg: ServerConfig, snd_ev: &mut Sender<Event>) {
        if cfg.host != self.cfg.host {
            deliver(
                snd_ev,
                Event::HostChanged {
                    host: cfg.host.clone(),
                },
            );
        }
        self.current_nick = cfg.nick.clone();
        self.autojoin = cfg.autojoin.clone();
        self.cfg = cfg;
    }

    fn send_ping(&mut self, snd_msg: &mut Sender<Outgoing>) {
        if let Some(ref servername) = self.servername {
            enqueue(snd_msg, wire::ping(servername));
        }
    }

    /// The registration sequence. A configured password only advertises the SASL capability;
    /// completing the authentication is not implemented.
    fn introduce(&mut self, snd_msg: &mut Sender<Outgoing>) {
        if self.cfg.pass.is_some() {
            enqueue(snd_msg, wire::cap_req(&["sasl"]));
        }
        enqueue(snd_msg, wire::nick(&self.current_nick));
        enqueue(snd_msg, wire::user(&self.cfg.username, &self.cfg.realname));
    }

    fn is_self(&self, nick: &str) -> bool {
        NickRef::new(nick) == NickRef::new(&self.current_nick)
    }

    fn update(&mut self, msg: Msg, snd_ev: &mut Sender<Event>, snd_msg: &mut Sender<Outgoing>) {
        let Msg { pfx, cmd } = msg;

        use wire::Cmd::*;
        match cmd {
            // PING: Answer with PONG. Not published.
            PING { server } => {
                enqueue(snd_msg, wire::pong(&server));
            }

            PRIVMSG {
                target,
                msg,
                is_notice,
                ctcp,
            } => match pfx {
                Some(Pfx::User { nick, .. }) if !is_notice => {
                    // CTCP envelopes (ACTION, mostly) are unwrapped by the wire parser; how to
                    // render them is the consumer's business.
                    let _ = ctcp;
                    let recipient = match target {
                        wire::MsgTarget::Chan(chan) => chan.into_string(),
                        wire::MsgTarget::User(user) => user,
                    };
                    deliver(
                        snd_ev,
                        Event::ReceivedPrivmsg {
                            sender: nick,
                            recipient,
                            msg,
                        },
                    );
                }
                pfx => fallback(
                    pfx,
                    PRIVMSG {
                        target,
                        msg,
                        is_notice,
                        ctcp,
                    },
                    snd_ev,
                ),
            },

            // JOIN: If this is us start collecting the join replies; the event is published when
            // RPL_ENDOFNAMES finishes the join. If someone else add the nick to the channel.
            JOIN { chan } => match pfx {
                Some(Pfx::User { nick, user }) => {
                    if self.is_self(&nick) {
                        self.usermask = Some(format!("{}!{}", nick, user));
                        self.joins_in_progress.insert(
                            chan,
                            JoinInProgress {
                                topic: None,
                                nicks: Vec::new(),
                            },
                        );
                    } else {
                        let nick = wire::drop_nick_prefix(&nick).to_owned();
                        match utils::find_idx(&self.chans, |c| c.name == chan) {
                            Some(chan_idx) => {
                                self.chans[chan_idx].nicks.insert(Nick::new(nick.clone()));
                            }
                            None => {
                                debug!("JOIN for unknown channel: {}", chan.display());
                            }
                        }
                        deliver(snd_ev, Event::UserJoined { nick, chan });
                    }
                }
                pfx => fallback(pfx, JOIN { chan }, snd_ev),
            },

            // PART: If this is us remove the channel (and stop rejoining it). Otherwise remove
            // the nick from the channel.
            PART { chan, msg: reason } => match pfx {
                Some(Pfx::User { nick, .. }) => {
                    if self.is_self(&nick) {
                        match utils::find_idx(&self.chans, |c| c.name == chan) {
                            Some(chan_idx) => {
                                self.chans.remove(chan_idx);
                            }
                            None => {
                                debug!("PART for unknown channel: {}", chan.display());
                            }
                        }
                        self.autojoin.retain(|c| *c != chan);
                        self.joins_in_progress.remove(&chan);
                        deliver(snd_ev, Event::SelfParted { chan });
                    } else {
                        if let Some(chan_idx) = utils::find_idx(&self.chans, |c| c.name == chan) {
                            self.chans[chan_idx]
                                .nicks
                                .remove(NickRef::new(wire::drop_nick_prefix(&nick)));
                        }
                        deliver(
                            snd_ev,
                            Event::UserParted {
                                nick,
                                chan,
                                reason,
                            },
                        );
                    }
                }
                pfx => fallback(pfx, PART { chan, msg: reason }, snd_ev),
            },

            // QUIT: Remove the user from every channel they were in.
            QUIT { msg: reason } => match pfx {
                Some(Pfx::User { nick, .. }) => {
                    for chan in self.chans.iter_mut() {
                        chan.nicks.remove(NickRef::new(&nick));
                    }
                    deliver(snd_ev, Event::UserQuit { nick, reason });
                }
                pfx => fallback(pfx, QUIT { msg: reason }, snd_ev),
            },

            // NICK: Update the member sets, and `current_nick` when the server acknowledged a
            // nick change of ours.
            NICK { nick: new_nick } => match pfx {
                Some(Pfx::User { nick: old_nick, .. }) => {
                    let is_self = self.is_self(&old_nick);
                    for chan in self.chans.iter_mut() {
                        if chan.nicks.remove(NickRef::new(&old_nick)) {
                            chan.nicks.insert(Nick::new(new_nick.clone()));
                        }
                    }
                    if is_self {
                        self.current_nick = new_nick.clone();
                        deliver(
                            snd_ev,
                            Event::SelfChangedNick {
                                old: old_nick,
                                new: new_nick,
                            },
                        );
                    } else {
                        deliver(
                            snd_ev,
                            Event::UserChangedNick {
                                old: old_nick,
                                new: new_nick,
                            },
                        );
                    }
                }
                pfx => fallback(pfx, NICK { nick: new_nick }, snd_ev),
            },

            TOPIC { chan, topic } => {
                // A topic between JOIN and RPL_ENDOFNAMES belongs to the join in progress,
                // whoever sent it.
                if let Some(join) = self.joins_in_progress.get_mut(&chan) {
                    join.topic = Some(topic);
                    return;
                }
                match pfx {
                    Some(Pfx::User { nick, .. }) => {
                        if let Some(chan_idx) = utils::find_idx(&self.chans, |c| c.name == chan) {
                            self.chans[chan_idx].topic = Some(topic.clone());
                        }
                        deliver(
                            snd_ev,
                            Event::TopicChanged {
                                chan,
                                setter: nick,
                                topic,
                            },
                        );
                    }
                    pfx => fallback(pfx, TOPIC { chan, topic }, snd_ev),
                }
            }

            // RPL_TOPIC: Part of a join in progress; on its own it's just another server line.
            Reply { num: 332, params } => {
                if params.len() >= 2 {
                    let chan = ChanNameRef::new(&params[params.len() - 2]);
                    if let Some(join) = self.joins_in_progress.get_mut(chan) {
                        join.topic = Some(params[params.len() - 1].clone());
                        return;
                    }
                }
                fallback(pfx, Reply { num: 332, params }, snd_ev);
            }

            // RPL_NAMREPLY: The last two args are the channel and the nick list; what comes
            // before them varies by server. Not published, the nick list is delivered with the
            // join event.
            Reply { num: 353, params } if params.len() >= 2 => {
                let chan = ChanNameRef::new(&params[params.len() - 2]);
                let names = &params[params.len() - 1];
                if let Some(join) = self.joins_in_progress.get_mut(chan) {
                    join.nicks.extend(
                        names
                            .split_whitespace()
                            .map(|s| wire::drop_nick_prefix(s).to_owned()),
                    );
                } else if let Some(chan_idx) = utils::find_idx(&self.chans, |c| c.name == *chan) {
                    // NAMES refresh for a channel we're already in
                    let nick_set = &mut self.chans[chan_idx].nicks;
                    for nick in names.split_whitespace() {
                        nick_set.insert(Nick::new(wire::drop_nick_prefix(nick).to_owned()));
                    }
                } else {
                    debug!("RPL_NAMREPLY for unknown channel: {}", chan.display());
                }
            }

            // RPL_ENDOFNAMES: The join is complete.
            Reply { num: 366, params } if params.len() >= 2 => {
                let chan_ref = ChanNameRef::new(&params[params.len() - 2]);
                match self.joins_in_progress.remove_entry(chan_ref) {
                    Some((chan, join)) => {
                        let topic_text =
                            join.topic.clone().unwrap_or_else(|| NO_TOPIC.to_owned());
                        let nick_set: HashSet<Nick> =
                            join.nicks.iter().map(|n| Nick::new(n.clone())).collect();
                        match utils::find_idx(&self.chans, |c| c.name == chan) {
                            Some(chan_idx) => {
                                // Rejoin after a reconnect; start the member set over
                                let c = &mut self.chans[chan_idx];
                                c.topic = join.topic;
                                c.nicks = nick_set;
                            }
                            None => self.chans.push(Chan {
                                name: chan.clone(),
                                topic: join.topic,
                                nicks: nick_set,
                            }),
                        }
                        if !self.autojoin.contains(&chan) {
                            self.autojoin.push(chan.clone());
                        }
                        deliver(
                            snd_ev,
                            Event::SelfJoined {
                                chan,
                                topic: topic_text,
                                nicks: join.nicks,
                            },
                        );
                    }
                    None => fallback(pfx, Reply { num: 366, params }, snd_ev),
                }
            }

            // RPL_ENDOFMOTD / ERR_NOMOTD: Registration is done; join the channels we're supposed
            // to be in and restore away state.
            Reply {
                num: num @ (376 | 422),
                params,
            } => {
                if !matches!(self.phase, ConnPhase::Registered) {
                    self.phase = ConnPhase::Registered;
                    for chan in &self.autojoin {
                        enqueue(snd_msg, wire::join(chan.as_ref()));
                    }
                    if self.away_status.is_some() {
                        enqueue(snd_msg, wire::away(self.away_status.as_deref()));
                    }
                }
                fallback(pfx, Reply { num, params }, snd_ev);
            }

            // RPL_YOURHOST: Set servername
            Reply { num: 002, params } => {
                // 002    RPL_YOURHOST
                //        "Your host is <servername>, running version <ver>"

                // An example <servername>: cherryh.freenode.net[149.56.134.238/8001]

                match parse_servername(pfx.as_ref(), &params) {
                    None => {
                        debug!("Could not parse server name in 002 RPL_YOURHOST message.");
                    }
                    Some(servername) => {
                        self.servername = Some(servername);
                    }
                }
                fallback(pfx, Reply { num: 002, params }, snd_ev);
            }

            // 396: Try to set usermask.
            Reply { num: 396, params } => {
                // :hobana.freenode.net 396 finn haskell/developer/finn
                // :is now your hidden host (set by services.)
                if params.len() == 3 {
                    let usermask = format!(
                        "{}!~{}@{}",
                        self.current_nick, self.cfg.username, params[1]
                    );
                    self.usermask = Some(usermask);
                }
                fallback(pfx, Reply { num: 396, params }, snd_ev);
            }

            // 302 RPL_USERHOST: Try to set usermask.
            Reply { num: 302, params } => {
                // :ircd.stealth.net 302 yournick :syrk=+syrk@millennium.stealth.net
                //
                // We know there will be only one nick because /userhost cmd sends
                // one parameter (our nick)
                //
                // Example args: ["finn", "finn=+omer@moz-s8a.9ac.93.91.IP "]

                if let Some(param) = params.get(1) {
                    match param.find('=') {
                        None => {
                            debug!("Could not parse 302 RPL_USERHOST to set usermask.");
                        }
                        Some(mut i) => {
                            if param.as_bytes().get(i + 1) == Some(&b'+')
                                || param.as_bytes().get(i + 1) == Some(&b'-')
                            {
                                i += 1;
                            }
                            let usermask = param[i..].trim();
                            self.usermask = Some(usermask.to_owned());
                        }
                    }
                }
                fallback(pfx, Reply { num: 302, params }, snd_ev);
            }

            // Everything else, including 433 ERR_NICKNAMEINUSE (the engine doesn't rotate nicks;
            // the consumer can issue a nick change) and 900 RPL_LOGGEDIN.
            cmd => fallback(pfx, cmd, snd_ev),
        }
    }

    fn get_chan_nicks(&self, chan: &ChanNameRef) -> Vec<String> {
        match utils::find_idx(&self.chans, |c| c.name == *chan) {
            None => vec![],
            Some(chan_idx) => {
                let mut nicks = self.chans[chan_idx]
                    .nicks
                    .iter()
                    .map(|n| n.display().to_owned())
                    .collect::<Vec<String>>();
                nicks.sort_unstable_by_key(|n| n.to_lowercase());
                nicks
            }
        }
    }
}

/// Publish an event. Best-effort: the engine must not die (or block the protocol loop) because
/// the consumer went away or stopped draining.
fn deliver(snd_ev: &mut Sender<Event>, ev: Event) {
    if let Err(err) = snd_ev.try_send(ev) {
        warn!("could not publish event: {}", err);
    }
}

/// Enqueue an outbound frame on the send pipeline, without a completion event.
fn enqueue(snd_msg: &mut Sender<Outgoing>, msg: String) {
    if snd_msg.try_send(msg.into()).is_err() {
        warn!("send queue closed or full, dropping outbound frame");
    }
}

/// Anything without a dedicated rule above: server-sent lines become `ServerMessage`, user-sent
/// ones `UnknownMessage`. A missing prefix means the message originates from the connection, so
/// it counts as server-sent.
fn fallback(pfx: Option<Pfx>, cmd: wire::Cmd, snd_ev: &mut Sender<Event>) {
    let (cmd, args) = raw_parts(cmd);
    match pfx {
        Some(Pfx::User { nick, .. }) => deliver(
            snd_ev,
            Event::UnknownMessage {
                sender: Some(nick),
                cmd,
                args,
            },
        ),
        Some(Pfx::Server(name)) => deliver(
            snd_ev,
            Event::ServerMessage {
                sender: Some(name),
                cmd,
                args,
            },
        ),
        None => deliver(
            snd_ev,
            Event::ServerMessage {
                sender: None,
                cmd,
                args,
            },
        ),
    }
}

/// The command name and argument list a parsed message came from, for the generic message events.
fn raw_parts(cmd: wire::Cmd) -> (String, Vec<String>) {
    use wire::Cmd::*;
    match cmd {
        PRIVMSG {
            target,
            msg,
            is_notice,
            ctcp: _,
        } => {
            let target = match target {
                wire::MsgTarget::Chan(chan) => chan.into_string(),
                wire::MsgTarget::User(user) => user,
            };
            let cmd = if is_notice { "NOTICE" } else { "PRIVMSG" };
            (cmd.to_owned(), vec![target, msg])
        }
        JOIN { chan } => ("JOIN".to_owned(), vec![chan.into_string()]),
        PART { chan, msg } => {
            let mut args = vec![chan.into_string()];
            args.extend(msg);
            ("PART".to_owned(), args)
        }
        QUIT { msg } => ("QUIT".to_owned(), msg.into_iter().collect()),
        NICK { nick } => ("NICK".to_owned(), vec![nick]),
        PING { server } => ("PING".to_owned(), vec![server]),
        PONG { server } => ("PONG".to_owned(), vec![server]),
        ERROR { msg } => ("ERROR".to_owned(), vec![msg]),
        TOPIC { chan, topic } => ("TOPIC".to_owned(), vec![chan.into_string(), topic]),
        Reply { num, params } => (format!("{:03}", num), params),
        Other { cmd, params } => (cmd, params),
    }
}

const SERVERNAME_PREFIX: &str = "Your host is ";
const SERVERNAME_PREFIX_LEN: usize = SERVERNAME_PREFIX.len();

/// Parse server name from RPL_YOURHOST reply or fallback to using the server name inside
/// Pfx::Server. See https://www.irc.com/dev/docs/refs/numerics/002.html for more info.
fn parse_servername(pfx: Option<&Pfx>, params: &[String]) -> Option<String> {
    parse_yourhost_msg(params).or_else(|| parse_server_pfx(pfx))
}

/// Try to parse servername in a 002 RPL_YOURHOST reply params.
fn parse_yourhost_msg(params: &[String]) -> Option<String> {
    let msg = params.get(1).or_else(|| params.get(0))?;
    if msg.len() >= SERVERNAME_PREFIX_LEN && &msg[..SERVERNAME_PREFIX_LEN] == SERVERNAME_PREFIX {
        let slice1 = &msg[SERVERNAME_PREFIX_LEN..];
        let servername_ends = slice1.find('[').or_else(|| slice1.find(','))?;
        Some(slice1[..servername_ends].to_owned())
    } else {
        None
    }
}

/// Get the server name from a prefix.
fn parse_server_pfx(pfx: Option<&Pfx>) -> Option<String> {
    match pfx {
        Some(Pfx::Server(server_name)) => Some(server_name.to_owned()),
        Some(Pfx::User { .. }) | None => None,
    }
}

////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn test_config() -> ServerConfig {
        ServerConfig {
            host: "irc.example.com".to_owned(),
            port: 6667,
            tls: false,
            nick: "me".to_owned(),
            username: "me".to_owned(),
            realname: "Me Myself".to_owned(),
            pass: None,
            autojoin: vec![],
        }
    }

    struct TestSetup {
        state: State,
        snd_ev: mpsc::Sender<Event>,
        rcv_ev: mpsc::Receiver<Event>,
        snd_msg: mpsc::Sender<Outgoing>,
        rcv_msg: mpsc::Receiver<Outgoing>,
    }

    fn setup(cfg: ServerConfig) -> TestSetup {
        let (snd_ev, rcv_ev) = mpsc::channel::<Event>(100);
        let (snd_msg, rcv_msg) = mpsc::channel::<Outgoing>(100);
        TestSetup {
            state: State::new(cfg),
            snd_ev,
            rcv_ev,
            snd_msg,
            rcv_msg,
        }
    }

    impl TestSetup {
        fn feed(&mut self, line: &str) {
            let mut buf = format!("{}\r\n", line).into_bytes();
            let msg = wire::parse_irc_msg(&mut buf)
                .expect("incomplete line")
                .expect("parse error");
            self.state.update(msg, &mut self.snd_ev, &mut self.snd_msg);
        }

        fn next_ev(&mut self) -> Event {
            self.rcv_ev.try_recv().expect("expected an event")
        }

        fn assert_no_ev(&mut self) {
            assert!(self.rcv_ev.try_recv().is_err());
        }

        fn next_sent_line(&mut self) -> String {
            self.rcv_msg.try_recv().expect("expected an outbound frame").msg
        }

        fn assert_nothing_sent(&mut self) {
            assert!(self.rcv_msg.try_recv().is_err());
        }

        fn join_chan(&mut self, chan: &str, names: &str) {
            self.feed(&format!(":me!u@h JOIN {}", chan));
            self.feed(&format!(":srv.example.com 353 me = {} :{}", chan, names));
            self.feed(&format!(
                ":srv.example.com 366 me {} :End of NAMES list",
                chan
            ));
        }
    }

    #[test]
    fn ping_answered_with_pong_silently() {
        let mut t = setup(test_config());
        t.feed("PING :abc");
        assert_eq!(t.next_sent_line(), "PONG :abc\r\n");
        t.assert_no_ev();
    }

    #[test]
    fn self_join_held_until_end_of_names() {
        let mut t = setup(test_config());
        t.feed(":me!u@h JOIN #foo");
        t.assert_no_ev();
        t.feed(":srv.example.com 353 me = #foo :@alice bob +carol");
        t.assert_no_ev();
        t.feed(":srv.example.com 366 me #foo :End of NAMES list");
        match t.next_ev() {
            Event::SelfJoined { chan, topic, nicks } => {
                assert_eq!(chan.display(), "#foo");
                assert_eq!(topic, "(no topic)");
                assert_eq!(nicks, vec!["alice", "bob", "carol"]);
            }
            ev => panic!("unexpected event: {:?}", ev),
        }
        t.assert_no_ev();
    }

    #[test]
    fn topic_during_join_lands_in_join_event() {
        let mut t = setup(test_config());
        t.feed(":me!u@h JOIN #foo");
        t.feed(":srv.example.com 353 me = #foo :me alice");
        t.feed(":srv.example.com 332 me #foo :hello world");
        t.assert_no_ev();
        t.feed(":srv.example.com 366 me #foo :End of NAMES list");
        match t.next_ev() {
            Event::SelfJoined { topic, .. } => assert_eq!(topic, "hello world"),
            ev => panic!("unexpected event: {:?}", ev),
        }
    }

    #[test]
    fn topic_cmd_during_join_lands_in_join_event() {
        let mut t = setup(test_config());
        t.feed(":me!u@h JOIN #foo");
        t.feed(":srv.example.com TOPIC #foo :set by the server");
        t.feed(":srv.example.com 366 me #foo :End of NAMES list");
        match t.next_ev() {
            Event::SelfJoined { topic, .. } => assert_eq!(topic, "set by the server"),
            ev => panic!("unexpected event: {:?}", ev),
        }
    }

    #[test]
    fn self_nick_change_propagates_to_members() {
        let mut cfg = test_config();
        cfg.nick = "alice".to_owned();
        cfg.username = "alice".to_owned();
        let mut t = setup(cfg);
        t.feed(":alice!u@h JOIN #x");
        t.feed(":srv.example.com 353 alice = #x :alice bob");
        t.feed(":srv.example.com 366 alice #x :End of NAMES list");
        t.next_ev(); // SelfJoined

        t.feed(":alice!u@h NICK :alice2");
        match t.next_ev() {
            Event::SelfChangedNick { old, new } => {
                assert_eq!(old, "alice");
                assert_eq!(new, "alice2");
            }
            ev => panic!("unexpected event: {:?}", ev),
        }
        assert_eq!(t.state.get_nick(), "alice2");
        assert_eq!(
            t.state.get_chan_nicks(ChanNameRef::new("#x")),
            vec!["alice2", "bob"]
        );
    }

    #[test]
    fn other_nick_change_propagates_to_members() {
        let mut t = setup(test_config());
        t.join_chan("#x", "me bob");
        t.next_ev(); // SelfJoined

        t.feed(":bob!u@h NICK :bobby");
        match t.next_ev() {
            Event::UserChangedNick { old, new } => {
                assert_eq!(old, "bob");
                assert_eq!(new, "bobby");
            }
            ev => panic!("unexpected event: {:?}", ev),
        }
        assert_eq!(
            t.state.get_chan_nicks(ChanNameRef::new("#x")),
            vec!["bobby", "me"]
        );
    }

    #[test]
    fn user_join_part_quit_update_members() {
        let mut t = setup(test_config());
        t.join_chan("#x", "me");
        t.next_ev(); // SelfJoined

        t.feed(":dan!u@h JOIN #x");
        match t.next_ev() {
            Event::UserJoined { nick, chan } => {
                assert_eq!(nick, "dan");
                assert_eq!(chan.display(), "#x");
            }
            ev => panic!("unexpected event: {:?}", ev),
        }
        assert_eq!(
            t.state.get_chan_nicks(ChanNameRef::new("#x")),
            vec!["dan", "me"]
        );

        t.feed(":dan!u@h PART #x :so long");
        match t.next_ev() {
            Event::UserParted { nick, chan, reason } => {
                assert_eq!(nick, "dan");
                assert_eq!(chan.display(), "#x");
                assert_eq!(reason.as_deref(), Some("so long"));
            }
            ev => panic!("unexpected event: {:?}", ev),
        }
        assert_eq!(t.state.get_chan_nicks(ChanNameRef::new("#x")), vec!["me"]);

        t.feed(":eve!u@h JOIN #x");
        t.next_ev();
        t.feed(":eve!u@h QUIT :gone");
        match t.next_ev() {
            Event::UserQuit { nick, reason } => {
                assert_eq!(nick, "eve");
                assert_eq!(reason.as_deref(), Some("gone"));
            }
            ev => panic!("unexpected event: {:?}", ev),
        }
        assert_eq!(t.state.get_chan_nicks(ChanNameRef::new("#x")), vec!["me"]);
    }

    #[test]
    fn self_part_removes_channel_and_autojoin_entry() {
        let mut t = setup(test_config());
        t.join_chan("#foo", "me");
        t.next_ev(); // SelfJoined
        assert!(t.state.inner.borrow().autojoin.contains(&ChanName::new("#foo".to_owned())));

        t.feed(":me!u@h PART #foo");
        match t.next_ev() {
            Event::SelfParted { chan } => assert_eq!(chan.display(), "#foo"),
            ev => panic!("unexpected event: {:?}", ev),
        }
        assert!(t.state.inner.borrow().autojoin.is_empty());
        assert!(t.state.inner.borrow().chans.is_empty());
    }

    #[test]
    fn end_of_motd_triggers_autojoin_replay() {
        let mut cfg = test_config();
        cfg.autojoin = vec![
            ChanName::new("#a".to_owned()),
            ChanName::new("#b".to_owned()),
        ];
        let mut t = setup(cfg);
        t.feed(":srv.example.com 376 me :End of /MOTD command.");
        assert_eq!(t.next_sent_line(), "JOIN #a\r\n");
        assert_eq!(t.next_sent_line(), "JOIN #b\r\n");
        // The MOTD tail is still shown as a server line
        match t.next_ev() {
            Event::ServerMessage { cmd, .. } => assert_eq!(cmd, "376"),
            ev => panic!("unexpected event: {:?}", ev),
        }
    }

    #[test]
    fn err_nomotd_counts_as_registered() {
        let mut cfg = test_config();
        cfg.autojoin = vec![ChanName::new("#a".to_owned())];
        let mut t = setup(cfg);
        t.feed(":srv.example.com 422 me :MOTD File is missing");
        assert_eq!(t.next_sent_line(), "JOIN #a\r\n");
        // A second end-of-MOTD doesn't re-join
        t.feed(":srv.example.com 376 me :End of /MOTD command.");
        t.assert_nothing_sent();
    }

    #[test]
    fn nickname_in_use_stalls_without_nick_rotation() {
        let mut t = setup(test_config());
        t.feed(":srv.example.com 433 * me :Nickname is already in use.");
        match t.next_ev() {
            Event::ServerMessage { cmd, .. } => assert_eq!(cmd, "433"),
            ev => panic!("unexpected event: {:?}", ev),
        }
        // No automatic new NICK attempt
        t.assert_nothing_sent();
        assert_eq!(t.state.get_nick(), "me");
    }

    #[test]
    fn privmsg_events() {
        let mut t = setup(test_config());
        t.feed(":bob!u@h PRIVMSG #chan :hello there");
        match t.next_ev() {
            Event::ReceivedPrivmsg {
                sender,
                recipient,
                msg,
            } => {
                assert_eq!(sender, "bob");
                assert_eq!(recipient, "#chan");
                assert_eq!(msg, "hello there");
            }
            ev => panic!("unexpected event: {:?}", ev),
        }

        t.feed(":bob!u@h PRIVMSG me :psst");
        match t.next_ev() {
            Event::ReceivedPrivmsg { recipient, .. } => assert_eq!(recipient, "me"),
            ev => panic!("unexpected event: {:?}", ev),
        }
    }

    #[test]
    fn user_notice_is_not_a_privmsg_event() {
        let mut t = setup(test_config());
        t.feed(":bob!u@h NOTICE me :automated reply");
        match t.next_ev() {
            Event::UnknownMessage { sender, cmd, args } => {
                assert_eq!(sender.as_deref(), Some("bob"));
                assert_eq!(cmd, "NOTICE");
                assert_eq!(args, vec!["me", "automated reply"]);
            }
            ev => panic!("unexpected event: {:?}", ev),
        }
    }

    #[test]
    fn topic_change_updates_channel() {
        let mut t = setup(test_config());
        t.join_chan("#x", "me bob");
        t.next_ev(); // SelfJoined

        t.feed(":bob!u@h TOPIC #x :fresh topic");
        match t.next_ev() {
            Event::TopicChanged {
                chan,
                setter,
                topic,
            } => {
                assert_eq!(chan.display(), "#x");
                assert_eq!(setter, "bob");
                assert_eq!(topic, "fresh topic");
            }
            ev => panic!("unexpected event: {:?}", ev),
        }
        assert_eq!(
            t.state.inner.borrow().chans[0].topic.as_deref(),
            Some("fresh topic")
        );
    }

    #[test]
    fn server_lines_become_server_messages() {
        let mut t = setup(test_config());
        t.feed(":srv.example.com 001 me :Welcome to the Example IRC Network me");
        match t.next_ev() {
            Event::ServerMessage { sender, cmd, args } => {
                assert_eq!(sender.as_deref(), Some("srv.example.com"));
                assert_eq!(cmd, "001");
                assert_eq!(args.len(), 2);
            }
            ev => panic!("unexpected event: {:?}", ev),
        }
    }

    #[test]
    fn channel_keys_fold_case() {
        let mut t = setup(test_config());
        // Join is announced with different casing than the NAMES replies
        t.feed(":me!u@h JOIN #Foo");
        t.feed(":srv.example.com 353 me = #foo :me alice");
        t.feed(":srv.example.com 366 me #FOO :End of NAMES list");
        match t.next_ev() {
            Event::SelfJoined { chan, nicks, .. } => {
                // Display casing is the one from the JOIN line
                assert_eq!(chan.display(), "#Foo");
                assert_eq!(nicks, vec!["me", "alice"]);
            }
            ev => panic!("unexpected event: {:?}", ev),
        }
        assert_eq!(t.state.inner.borrow().chans.len(), 1);

        // Member updates with a different casing hit the same channel
        t.feed(":dan!u@h JOIN #fOO");
        t.next_ev();
        assert_eq!(
            t.state.get_chan_nicks(ChanNameRef::new("#FOO")),
            vec!["alice", "dan", "me"]
        );
    }

    #[test]
    fn rejoin_after_reconnect_replaces_members() {
        let mut t = setup(test_config());
        t.join_chan("#x", "me alice bob");
        t.next_ev();

        // Connection drops, the main loop resets per-connection state
        t.state.reset();
        assert!(t.state.inner.borrow().chans.is_empty());
        assert!(!t.state.inner.borrow().autojoin.is_empty());

        t.join_chan("#x", "me carol");
        match t.next_ev() {
            Event::SelfJoined { nicks, .. } => assert_eq!(nicks, vec!["me", "carol"]),
            ev => panic!("unexpected event: {:?}", ev),
        }
        assert_eq!(t.state.inner.borrow().chans.len(), 1);
    }

    #[test]
    fn introduce_with_password_advertises_sasl() {
        let mut cfg = test_config();
        cfg.pass = Some("hunter2".to_owned());
        let mut t = setup(cfg);
        t.state.introduce(&mut t.snd_msg);
        assert_eq!(t.next_sent_line(), "CAP REQ :sasl\r\n");
        assert_eq!(t.next_sent_line(), "NICK me\r\n");
        assert_eq!(t.next_sent_line(), "USER me 0 * :Me Myself\r\n");
    }

    #[test]
    fn introduce_without_password() {
        let mut t = setup(test_config());
        t.state.introduce(&mut t.snd_msg);
        assert_eq!(t.next_sent_line(), "NICK me\r\n");
        assert_eq!(t.next_sent_line(), "USER me 0 * :Me Myself\r\n");
    }

    #[test]
    fn apply_config_emits_host_changed() {
        let mut t = setup(test_config());
        let mut new_cfg = test_config();
        new_cfg.host = "irc.elsewhere.net".to_owned();
        t.state.apply_config(new_cfg, &mut t.snd_ev);
        match t.next_ev() {
            Event::HostChanged { host } => assert_eq!(host, "irc.elsewhere.net"),
            ev => panic!("unexpected event: {:?}", ev),
        }

        // Same host: no event
        let same_cfg = ServerConfig {
            host: "irc.elsewhere.net".to_owned(),
            ..test_config()
        };
        t.state.apply_config(same_cfg, &mut t.snd_ev);
        t.assert_no_ev();
    }

    #[test]
    fn test_parse_servername_1() {
        // IRC standard
        let prefix = Some(Pfx::Server("card.freenode.net".to_string()));
        let params = vec![
            "nickname".to_string(),
            "Your host is card.freenode.net[38.229.70.22/6697], running version ircd-seven-1.1.9"
                .to_string(),
        ];
        assert_eq!(
            parse_servername(prefix.as_ref(), &params),
            Some("card.freenode.net".to_owned())
        );

        let prefix = Some(Pfx::Server("irc.eagle.y.se".to_string()));
        let params = vec![
            "nickname".to_string(),
            "Your host is irc.eagle.y.se, running version UnrealIRCd-4.0.18".to_string(),
        ];
        assert_eq!(
            parse_servername(prefix.as_ref(), &params),
            Some("irc.eagle.y.se".to_owned())
        );
    }

    #[test]
    fn test_parse_servername_2() {
        // Gitter variation
        // Msg { pfx: Some(Server("irc.gitter.im")), cmd: Reply { num: 2, params: ["nickname", " 1.10.0"] } }
        let prefix = Some(Pfx::Server("irc.gitter.im".to_string()));
        let params = vec!["nickname".to_string(), " 1.10.0".to_string()];
        assert_eq!(
            parse_servername(prefix.as_ref(), &params),
            Some("irc.gitter.im".to_owned())
        );
    }
}
