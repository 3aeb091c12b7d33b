#![allow(clippy::write_with_newline)]

//! IRC wire protocol message parsers and generators. Incomplete; new messages are added as needed.
//!
//! This library is for implementing clients rather than servers or services, and does not support
//! the IRC message format in full generality.

use lazy_static::lazy_static;
use libminnow_common::{ChanName, ChanNameRef};
use regex::Regex;

/// Maximum length of a wire message in bytes, including the trailing "\r\n" (RFC 2812).
pub const MAX_MSG_LEN: usize = 512;

/// Nick syntax per RFC 2812 section 2.3.1, with the length capped at 16 characters as seen on
/// Libera and friends (15 is 16 minus the first character).
pub static NICK_PATTERN: &str = r"[A-Za-z\[\]\\`_\^\{\|\}][A-Za-z0-9\-\[\]\\`_\^\{\|\}]{0,15}";

/// Channel name syntax per RFC 2812 section 1.3. Channel names don't need to start with '#'.
/// At most 50 characters; space, BEL and comma are forbidden.
pub static CHANNEL_PATTERN: &str = r"[&#+!][^ \x07,]{1,49}";

lazy_static! {
    pub static ref NICK_REGEX: Regex = Regex::new(&format!("^{}$", NICK_PATTERN)).unwrap();
    pub static ref CHANNEL_REGEX: Regex = Regex::new(&format!("^{}$", CHANNEL_PATTERN)).unwrap();
}

/// Is the string a syntactically valid nick?
pub fn is_nick(s: &str) -> bool {
    NICK_REGEX.is_match(s)
}

/// Is the string a syntactically valid channel name?
pub fn is_chan(s: &str) -> bool {
    CHANNEL_REGEX.is_match(s)
}

//
// Message generation
//

// FIXME: Option<String> because going from Option<String> to Option<&str> is too painful...
pub fn quit(reason: Option<String>) -> String {
    match reason {
        None => "QUIT\r\n".to_string(),
        Some(reason) => format!("QUIT :{}\r\n", reason),
    }
}

pub fn user(username: &str, realname: &str) -> String {
    format!("USER {} 0 * :{}\r\n", username, realname)
}

pub fn nick(arg: &str) -> String {
    format!("NICK {}\r\n", arg)
}

pub fn ping(arg: &str) -> String {
    format!("PING {}\r\n", arg)
}

pub fn pong(arg: &str) -> String {
    format!("PONG :{}\r\n", arg)
}

pub fn join(chan: &ChanNameRef) -> String {
    format!("JOIN {}\r\n", chan.display())
}

pub fn part(chan: &ChanNameRef, reason: Option<String>) -> String {
    match reason {
        None => format!("PART {}\r\n", chan.display()),
        Some(reason) => format!("PART {} :{}\r\n", chan.display(), reason),
    }
}

pub fn privmsg(msgtarget: &str, msg: &str) -> String {
    // IRC messages need to be shorter than 512 bytes (see RFC 1459 or 2812). This should be dealt
    // with at call sites as we can't show how we split messages into multiple messages in the UI
    // at this point.
    debug_assert!(msgtarget.len() + msg.len() + 12 <= MAX_MSG_LEN);
    format!("PRIVMSG {} :{}\r\n", msgtarget, msg)
}

pub fn action(msgtarget: &str, msg: &str) -> String {
    debug_assert!(msgtarget.len() + msg.len() + 21 <= MAX_MSG_LEN); // See comments in `privmsg`
    format!("PRIVMSG {} :\x01ACTION {}\x01\r\n", msgtarget, msg)
}

pub fn topic(chan: &ChanNameRef, topic: &str) -> String {
    format!("TOPIC {} :{}\r\n", chan.display(), topic)
}

pub fn away(msg: Option<&str>) -> String {
    match msg {
        None => "AWAY\r\n".to_string(),
        Some(msg) => format!("AWAY :{}\r\n", msg),
    }
}

pub fn cap_req(cap_identifiers: &[&str]) -> String {
    format!("CAP REQ :{}\r\n", cap_identifiers.join(" "))
}

/// Serialize a command with arguments. The trailing argument is prefixed with ':' if and only if
/// it contains a space, is empty, or itself starts with ':'; the result always ends in "\r\n".
/// Inverse of the parser for the messages this library generates.
pub fn encode(cmd: &str, args: &[&str]) -> String {
    let mut out = String::with_capacity(
        cmd.len() + args.iter().map(|a| a.len() + 2).sum::<usize>() + 2,
    );
    out.push_str(cmd);
    for (idx, arg) in args.iter().enumerate() {
        out.push(' ');
        if idx == args.len() - 1 && (arg.is_empty() || arg.contains(' ') || arg.starts_with(':')) {
            out.push(':');
        }
        out.push_str(arg);
    }
    out.push_str("\r\n");
    out
}

/// Cap an outbound line at `MAX_MSG_LEN` bytes, keeping the "\r\n" suffix and cutting at a char
/// boundary. Lines within the limit are returned unchanged.
pub fn enforce_max_len(mut msg: String) -> String {
    if msg.len() <= MAX_MSG_LEN {
        return msg;
    }
    let mut cut = MAX_MSG_LEN - 2;
    while !msg.is_char_boundary(cut) {
        cut -= 1;
    }
    msg.truncate(cut);
    msg.push_str("\r\n");
    msg
}

//
// Message parsing
//

/// Sender of a message ("prefix" in the RFC). A prefix that contains '!' is a user prefix
/// (`nick!user@host`); anything else is taken to be a server name. Users of this library need the
/// distinction to decide e.g. whether a PRIVMSG should be attributed to a person or shown as
/// server noise.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum Pfx {
    /// Sender is a server.
    Server(String),

    /// Sender is a nick.
    User {
        /// Nick of the sender
        nick: String,
        /// `user@host` part
        user: String,
    },
}

fn parse_pfx(pfx: &str) -> Pfx {
    match pfx.find('!') {
        Some(idx) => Pfx::User {
            nick: pfx[0..idx].to_owned(),
            user: pfx[idx + 1..].to_owned(),
        },
        None => Pfx::Server(pfx.to_owned()),
    }
}

/// Target of a message.
///
/// Masks are not parsed; the rule here is the channel-name rule: a target starting with one of
/// `&#+!` is a `Chan`, anything else is a `User`.
#[derive(Debug, PartialEq, Eq)]
pub enum MsgTarget {
    Chan(ChanName),
    User(String),
}

/// An IRC message
#[derive(Debug, PartialEq, Eq)]
pub struct Msg {
    /// Sender of a message. According to RFC 2812 it's optional:
    ///
    /// > If the prefix is missing from the message, it is assumed to have originated from the
    /// > connection from which it was received from.
    pub pfx: Option<Pfx>,
    pub cmd: Cmd,
}

/// A client-to-client protocol message. See https://defs.ircdocs.horse/defs/ctcp.html
#[derive(Debug, PartialEq, Eq)]
pub enum CTCP {
    Version,
    Action,
    Other(String),
}

impl CTCP {
    fn parse(s: &str) -> CTCP {
        match s {
            "VERSION" => CTCP::Version,
            "ACTION" => CTCP::Action,
            _ => CTCP::Other(s.to_owned()),
        }
    }
}

/// An IRC command or reply
#[derive(Debug, PartialEq, Eq)]
pub enum Cmd {
    /// A PRIVMSG or NOTICE. Check `is_notice` field.
    PRIVMSG {
        // TODO: In theory this should be a list of targets, but in practice I've never
        // encountered that case.
        target: MsgTarget,
        msg: String,
        is_notice: bool,
        ctcp: Option<CTCP>,
    },

    JOIN {
        // TODO: Same as above, this should be a list ...
        chan: ChanName,
    },

    PART {
        chan: ChanName,
        msg: Option<String>,
    },

    QUIT {
        msg: Option<String>,
    },

    NICK {
        nick: String,
    },

    PING {
        server: String,
    },

    PONG {
        server: String,
    },

    ERROR {
        msg: String,
    },

    TOPIC {
        chan: ChanName,
        topic: String,
    },

    /// An IRC message other than the ones listed above.
    Other {
        cmd: String,
        params: Vec<String>,
    },

    /// Numeric replies are kept generic as there are just too many replies and we probably only
    /// need to handle a small subset of them.
    Reply {
        num: u16,
        params: Vec<String>,
    },
}

/// An intermediate type used during parsing.
enum MsgType<'a> {
    Cmd(&'a str),
    Num(u16),
}

/// Try to read an IRC message off a buffer. Drops the message bytes (and any empty lines before
/// it) when a complete line is available, whether or not it parses. Lines are terminated by
/// "\r\n", but a bare '\n' is also accepted as seen in the wild. The buffer is left unchanged
/// when it does not contain a complete line.
pub fn parse_irc_msg(buf: &mut Vec<u8>) -> Option<Result<Msg, String>> {
    loop {
        // Find the line terminator first; we can't do this *after* generating the lossy UTF-8, as
        // that may have a different size than the original buffer after inserting "REPLACEMENT
        // CHARACTER"s.
        let nl_idx = buf.iter().position(|b| *b == b'\n')?;
        let line_end = if nl_idx > 0 && buf[nl_idx - 1] == b'\r' {
            nl_idx - 1
        } else {
            nl_idx
        };

        let msg_owned: String = String::from_utf8_lossy(&buf[0..line_end]).to_string();
        buf.drain(0..nl_idx + 1);

        if msg_owned.is_empty() {
            // "Empty messages are silently ignored" (RFC 2812 section 2.3.1)
            continue;
        }

        return Some(parse_one_message(&msg_owned));
    }
}

// NB. 'msg' does not contain the line terminator.
fn parse_one_message(mut msg: &str) -> Result<Msg, String> {
    let pfx: Option<Pfx> = {
        if let Some(':') = msg.chars().next() {
            // parse prefix
            let ws_idx = msg.find(' ').ok_or(format!(
                "Can't find prefix terminator (' ') in msg: {:?}",
                msg
            ))?;
            let pfx = &msg[1..ws_idx]; // consume ':'
            msg = &msg[ws_idx + 1..]; // consume ' '
            Some(parse_pfx(pfx))
        } else {
            None
        }
    };

    let msg_ty: MsgType = {
        let ws_idx = msg.find(' ').ok_or(format!(
            "Can't find message type terminator (' ') in msg: {:?}",
            msg
        ))?;
        let cmd = &msg[..ws_idx];
        msg = &msg[ws_idx + 1..]; // Consume ' '
        match cmd.parse::<u16>() {
            Ok(num) => MsgType::Num(num),
            Err(_) => MsgType::Cmd(cmd),
        }
    };

    let params = parse_params(msg);
    let cmd = match msg_ty {
        MsgType::Cmd("PRIVMSG") | MsgType::Cmd("NOTICE") if params.len() == 2 => {
            let is_notice = matches!(msg_ty, MsgType::Cmd("NOTICE"));
            let target = params[0];
            let mut msg = params[1];
            let target = if target.starts_with(&['&', '#', '+', '!'][..]) {
                MsgTarget::Chan(ChanName::new(target.to_owned()))
            } else {
                MsgTarget::User(target.to_owned())
            };

            let mut ctcp: Option<CTCP> = None;
            if !msg.is_empty() && msg.as_bytes()[0] == 0x01 {
                // Drop 0x01
                msg = &msg[1..];
                // Parse message type
                for (byte_idx, byte) in msg.as_bytes().iter().enumerate() {
                    if *byte == 0x01 {
                        let ctcp_type = &msg[0..byte_idx];
                        ctcp = Some(CTCP::parse(ctcp_type));
                        msg = &msg[byte_idx + 1..];
                        break;
                    } else if *byte == b' ' {
                        let ctcp_type = &msg[0..byte_idx];
                        ctcp = Some(CTCP::parse(ctcp_type));
                        msg = &msg[byte_idx + 1..];
                        if !msg.is_empty() && msg.as_bytes()[msg.len() - 1] == 0x01 {
                            msg = &msg[..msg.len() - 1];
                        }
                        break;
                    }
                }
            }

            Cmd::PRIVMSG {
                target,
                msg: msg.to_owned(),
                is_notice,
                ctcp,
            }
        }
        MsgType::Cmd("JOIN") if params.len() == 1 => {
            let chan = params[0];
            Cmd::JOIN {
                chan: ChanName::new(chan.to_owned()),
            }
        }
        MsgType::Cmd("PART") if params.len() == 1 || params.len() == 2 => {
            let mb_msg = if params.len() == 2 {
                Some(params[1].to_owned())
            } else {
                None
            };
            Cmd::PART {
                chan: ChanName::new(params[0].to_owned()),
                msg: mb_msg,
            }
        }
        MsgType::Cmd("QUIT") if params.is_empty() || params.len() == 1 => {
            let mb_msg = params.get(0).map(|s| (*s).to_owned());
            Cmd::QUIT { msg: mb_msg }
        }
        MsgType::Cmd("NICK") if params.len() == 1 => {
            let nick = params[0];
            Cmd::NICK {
                nick: nick.to_owned(),
            }
        }
        MsgType::Cmd("PING") if params.len() == 1 => Cmd::PING {
            server: params[0].to_owned(),
        },
        MsgType::Cmd("PONG") if !params.is_empty() => Cmd::PONG {
            server: params[0].to_owned(),
        },
        MsgType::Cmd("ERROR") if params.len() == 1 => Cmd::ERROR {
            msg: params[0].to_owned(),
        },
        MsgType::Cmd("TOPIC") if params.len() == 2 => Cmd::TOPIC {
            chan: ChanName::new(params[0].to_owned()),
            topic: params[1].to_owned(),
        },
        MsgType::Num(n) => Cmd::Reply {
            num: n,
            params: params.into_iter().map(|s| s.to_owned()).collect(),
        },
        MsgType::Cmd(cmd) => Cmd::Other {
            cmd: cmd.to_owned(),
            params: params.into_iter().map(|s| s.to_owned()).collect(),
        },
    };

    Ok(Msg { pfx, cmd })
}

fn parse_params(chrs: &str) -> Vec<&str> {
    // RFC 2812:
    //
    //     params     =  *14( SPACE middle ) [ SPACE ":" trailing ]
    //                =/ 14( SPACE middle ) [ SPACE [ ":" ] trailing ]
    //
    //     nospcrlfcl =  %x01-09 / %x0B-0C / %x0E-1F / %x21-39 / %x3B-FF
    //                     ; any octet except NUL, CR, LF, " " and ":"
    //     middle     =  nospcrlfcl *( ":" / nospcrlfcl )
    //     trailing   =  *( ":" / " " / nospcrlfcl )
    //
    // The RFC doesn't explain the syntax with `14` here as if it's something standard. I'm
    // guessing it's number of repetitions, and `*14` means "14 or less" repetitions.

    let mut params = Vec::new();
    let mut char_indices = chrs.char_indices();

    while let Some((idx, c)) = char_indices.next() {
        if c == ':' {
            params.push(&chrs[idx + 1..]); // Skip ':'
            break;
        }

        if params.len() == 14 {
            params.push(&chrs[idx..]);
            break;
        }

        if c == ' ' {
            continue;
        }

        loop {
            match char_indices.next() {
                Some((idx_, c)) => {
                    if c == ' ' {
                        params.push(&chrs[idx..idx_]);
                        break;
                    }
                }
                None => {
                    params.push(&chrs[idx..]);
                    break;
                }
            }
        }
    }

    params
}

/// Nicks may have prefixes, indicating it is a operator, founder, or something else.
///
/// Channel Membership Prefixes: http://modern.ircdocs.horse/#channel-membership-prefixes
///
/// Returns the nick without prefix.
pub fn drop_nick_prefix(nick: &str) -> &str {
    static PREFIXES: [char; 5] = ['~', '&', '@', '%', '+'];

    if nick.starts_with(&PREFIXES[..]) {
        &nick[1..]
    } else {
        nick
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_params() {
        assert_eq!(parse_params("p1 p2 p3"), vec!["p1", "p2", "p3"]);
        let empty: Vec<&str> = vec![];
        assert_eq!(parse_params(""), empty);
        assert_eq!(parse_params(":foo bar baz "), vec!["foo bar baz "]);
        assert_eq!(
            parse_params(":foo : bar : baz :"),
            vec!["foo : bar : baz :"]
        );
        assert_eq!(parse_params(":"), vec![""]);
        assert_eq!(parse_params("x:"), vec!["x:"]);
        assert_eq!(parse_params("x:y"), vec!["x:y"]);
        assert_eq!(parse_params("x:y:z"), vec!["x:y:z"]);
        assert_eq!(parse_params(":::::"), vec!["::::"]);

        let params = parse_params("1 2 3 4 5 6 7 8 9 10 11 12 13 14 blah blah blah");
        assert_eq!(params.len(), 15);
        assert_eq!(params[params.len() - 1], "blah blah blah");

        assert_eq!(parse_params("   "), empty); // Not valid according to the RFC, I think
        assert_eq!(parse_params(":  "), vec!["  "]);
        assert_eq!(parse_params(": : :"), vec![" : :"]);
        assert_eq!(parse_params("x y : : :"), vec!["x", "y", " : :"]);
        assert_eq!(parse_params("aaa://aaa"), vec!["aaa://aaa"]);
    }

    #[test]
    fn test_privmsg_parsing() {
        let mut buf = vec![];
        write!(
            &mut buf,
            ":nick!~nick@unaffiliated/nick PRIVMSG minnow :a b c\r\n"
        )
        .unwrap();
        assert_eq!(
            parse_irc_msg(&mut buf).unwrap().unwrap(),
            Msg {
                pfx: Some(Pfx::User {
                    nick: "nick".to_owned(),
                    user: "~nick@unaffiliated/nick".to_owned(),
                }),
                cmd: Cmd::PRIVMSG {
                    target: MsgTarget::User("minnow".to_owned()),
                    msg: "a b c".to_owned(),
                    is_notice: false,
                    ctcp: None,
                },
            }
        );
        assert_eq!(buf.len(), 0);
    }

    #[test]
    fn test_notice_parsing() {
        let mut buf = vec![];
        write!(
            &mut buf,
            ":barjavel.freenode.net NOTICE * :*** Looking up your hostname...\r\n"
        )
        .unwrap();
        assert_eq!(
            parse_irc_msg(&mut buf).unwrap().unwrap(),
            Msg {
                pfx: Some(Pfx::Server("barjavel.freenode.net".to_owned())),
                cmd: Cmd::PRIVMSG {
                    target: MsgTarget::User("*".to_owned()),
                    msg: "*** Looking up your hostname...".to_owned(),
                    is_notice: true,
                    ctcp: None,
                },
            }
        );
    }

    #[test]
    fn test_numeric_parsing() {
        let mut buf = vec![];
        write!(
            &mut buf,
            ":barjavel.freenode.net 001 minnow :Welcome to the freenode Internet Relay Chat Network minnow\r\n"
        ).unwrap();
        write!(
            &mut buf,
            ":barjavel.freenode.net 002 minnow :Your host is barjavel.freenode.net[123.123.123.123/8001], \
             running version ircd-seven-1.1.4\r\n"
        ).unwrap();
        write!(
            &mut buf,
            ":barjavel.freenode.net 004 minnow_test barjavel.freenode.net \
             ircd-seven-1.1.4 DOQRSZaghilopswz \
             CFILMPQSbcefgijklmnopqrstvz bkloveqjfI\r\n"
        )
        .unwrap();
        write!(
            &mut buf,
            ":barjavel.freenode.net 005 minnow_test CHANTYPES=# EXCEPTS INVEX \
             CHANMODES=eIbq,k,flj,CFLMPQScgimnprstz CHANLIMIT=#:120 PREFIX=(ov)@+ \
             MAXLIST=bqeI:100 MODES=4 NETWORK=freenode STATUSMSG=@+ CALLERID=g \
             CASEMAPPING=rfc1459 :are supported by this server\r\n"
        )
        .unwrap();

        let mut msgs = vec![];
        while let Some(Ok(msg)) = parse_irc_msg(&mut buf) {
            assert_eq!(
                msg.pfx,
                Some(Pfx::Server("barjavel.freenode.net".to_owned()))
            );
            msgs.push(msg);
        }

        assert_eq!(msgs.len(), 4);
    }

    #[test]
    fn test_part_parsing() {
        let mut buf = vec![];
        write!(&mut buf, ":minnow!~minnow@123.123.123.123 PART #haskell\r\n").unwrap();
        assert_eq!(
            parse_irc_msg(&mut buf).unwrap().unwrap(),
            Msg {
                pfx: Some(Pfx::User {
                    nick: "minnow".to_owned(),
                    user: "~minnow@123.123.123.123".to_owned(),
                }),
                cmd: Cmd::PART {
                    chan: ChanName::new("#haskell".to_owned()),
                    msg: None,
                },
            }
        );
    }

    #[test]
    fn test_join_parsing() {
        let mut buf = vec![];
        write!(&mut buf, ":minnow!~minnow@192.168.0.1 JOIN #haskell\r\n").unwrap();
        assert_eq!(
            parse_irc_msg(&mut buf).unwrap().unwrap(),
            Msg {
                pfx: Some(Pfx::User {
                    nick: "minnow".to_owned(),
                    user: "~minnow@192.168.0.1".to_owned(),
                }),
                cmd: Cmd::JOIN {
                    chan: ChanName::new("#haskell".to_owned()),
                },
            }
        );
        assert_eq!(buf.len(), 0);
    }

    #[test]
    fn test_bare_newline_terminator() {
        // Some servers (and bouncers) terminate lines with a bare '\n'
        let mut buf = vec![];
        write!(&mut buf, "PING :irc.example.com\n").unwrap();
        assert_eq!(
            parse_irc_msg(&mut buf).unwrap().unwrap(),
            Msg {
                pfx: None,
                cmd: Cmd::PING {
                    server: "irc.example.com".to_owned(),
                },
            }
        );
        assert_eq!(buf.len(), 0);
    }

    #[test]
    fn test_empty_lines_skipped() {
        let mut buf = vec![];
        write!(&mut buf, "\r\n\n:n!u@h NICK :n2\r\n").unwrap();
        assert_eq!(
            parse_irc_msg(&mut buf).unwrap().unwrap(),
            Msg {
                pfx: Some(Pfx::User {
                    nick: "n".to_owned(),
                    user: "u@h".to_owned(),
                }),
                cmd: Cmd::NICK {
                    nick: "n2".to_owned(),
                },
            }
        );
        assert!(parse_irc_msg(&mut buf).is_none());
    }

    #[test]
    fn test_partial_line_buffered() {
        let mut buf = vec![];
        write!(&mut buf, ":srv 366 me #chan :End of NAME").unwrap();
        assert!(parse_irc_msg(&mut buf).is_none());
        // Buffer is left intact until the terminator arrives
        write!(&mut buf, "S list\r\n").unwrap();
        assert_eq!(
            parse_irc_msg(&mut buf).unwrap().unwrap().cmd,
            Cmd::Reply {
                num: 366,
                params: vec![
                    "me".to_owned(),
                    "#chan".to_owned(),
                    "End of NAMES list".to_owned()
                ],
            }
        );
    }

    #[test]
    fn test_invalid_utf8_replaced() {
        let mut buf: Vec<u8> = b":n!u@h PRIVMSG #x :a\xc3\x28b\r\n".to_vec();
        match parse_irc_msg(&mut buf).unwrap().unwrap().cmd {
            Cmd::PRIVMSG { msg, .. } => {
                assert_eq!(msg, "a\u{FFFD}(b");
            }
            cmd => panic!("unexpected parse: {:?}", cmd),
        }
    }

    // Example from https://tools.ietf.org/id/draft-oakley-irc-ctcp-01.html
    #[test]
    fn test_ctcp_action_parsing() {
        let mut buf = vec![];
        write!(
            &mut buf,
            ":dan!u@localhost PRIVMSG #ircv3 :\x01ACTION writes some specs!\x01\r\n"
        )
        .unwrap();
        assert_eq!(
            parse_irc_msg(&mut buf).unwrap().unwrap(),
            Msg {
                pfx: Some(Pfx::User {
                    nick: "dan".to_owned(),
                    user: "u@localhost".to_owned(),
                }),
                cmd: Cmd::PRIVMSG {
                    target: MsgTarget::Chan(ChanName::new("#ircv3".to_owned())),
                    msg: "writes some specs!".to_owned(),
                    is_notice: false,
                    ctcp: Some(CTCP::Action),
                },
            }
        );
        assert_eq!(buf.len(), 0);
    }

    #[test]
    fn test_ctcp_action_parsing_without_final_delim() {
        // From https://modern.ircdocs.horse/ctcp.html:
        //
        // > The final <delim> MUST be sent, but parsers SHOULD accept incoming messages which lack
        // > it (particularly for CTCP ACTION). This is due to how some software incorrectly
        // > implements message splitting.
        let mut buf = vec![];
        write!(
            &mut buf,
            ":a!b@c PRIVMSG target :\x01ACTION msg contents\r\n"
        )
        .unwrap();
        assert_eq!(
            parse_irc_msg(&mut buf).unwrap().unwrap().cmd,
            Cmd::PRIVMSG {
                target: MsgTarget::User("target".to_owned()),
                msg: "msg contents".to_owned(),
                is_notice: false,
                ctcp: Some(CTCP::Action),
            }
        );
        assert_eq!(buf.len(), 0);
    }

    #[test]
    fn test_ctcp_version_parsing() {
        let mut buf = vec![];
        write!(&mut buf, ":a!b@c PRIVMSG target :\x01VERSION\x01\r\n").unwrap();
        assert_eq!(
            parse_irc_msg(&mut buf).unwrap().unwrap().cmd,
            Cmd::PRIVMSG {
                target: MsgTarget::User("target".to_owned()),
                msg: "".to_owned(),
                is_notice: false,
                ctcp: Some(CTCP::Version),
            }
        );
    }

    #[test]
    fn test_error_parsing() {
        let mut buf = vec![];
        write!(
            &mut buf,
            "ERROR :Closing Link: 212.252.143.51 (Excess Flood)\r\n"
        )
        .unwrap();
        assert_eq!(
            parse_irc_msg(&mut buf).unwrap().unwrap(),
            Msg {
                pfx: None,
                cmd: Cmd::ERROR {
                    msg: "Closing Link: 212.252.143.51 (Excess Flood)".to_owned(),
                },
            },
        );
    }

    #[test]
    fn test_parse_pfx() {
        use Pfx::*;
        // No '!': server, even when it looks nick-ish
        assert_eq!(parse_pfx("xyz"), Server("xyz".to_string()));
        assert_eq!(
            parse_pfx("fe-00106.xyz.net"),
            Server("fe-00106.xyz.net".to_string())
        );
        assert_eq!(
            parse_pfx("finn!finn@x.y.im"),
            User {
                nick: "finn".to_string(),
                user: "finn@x.y.im".to_string(),
            }
        );
        assert_eq!(
            parse_pfx("IRC!IRC@fe-00106.xyz.net"),
            User {
                nick: "IRC".to_string(),
                user: "IRC@fe-00106.xyz.net".to_string()
            }
        );
    }

    #[test]
    fn test_encode_trailing_colon_rule() {
        assert_eq!(encode("JOIN", &["#chan"]), "JOIN #chan\r\n");
        assert_eq!(
            encode("PRIVMSG", &["#chan", "hello world"]),
            "PRIVMSG #chan :hello world\r\n"
        );
        assert_eq!(encode("TOPIC", &["#chan", ""]), "TOPIC #chan :\r\n");
        assert_eq!(encode("FOO", &["x", ":y"]), "FOO x ::y\r\n");
        assert_eq!(encode("QUIT", &[]), "QUIT\r\n");
    }

    #[test]
    fn test_encode_parse_round_trip() {
        let cases: Vec<(&str, Vec<&str>)> = vec![
            ("PRIVMSG", vec!["#chan", "hello world"]),
            ("PRIVMSG", vec!["dan", "no-space"]),
            ("JOIN", vec!["#chan"]),
            ("PART", vec!["#chan", "bye for now"]),
            ("NICK", vec!["newnick"]),
            ("TOPIC", vec!["#chan", ":starts with colon"]),
        ];
        for (cmd, args) in cases {
            let mut buf = encode(cmd, &args).into_bytes();
            let msg = parse_irc_msg(&mut buf)
                .expect("no complete line")
                .expect("parse error");
            assert_eq!(buf.len(), 0);
            // Re-encoding the parsed message must produce the same line
            let (cmd2, args2) = match msg.cmd {
                Cmd::PRIVMSG { target, msg, .. } => (
                    "PRIVMSG",
                    vec![
                        match target {
                            MsgTarget::Chan(c) => c.into_string(),
                            MsgTarget::User(u) => u,
                        },
                        msg,
                    ],
                ),
                Cmd::JOIN { chan } => ("JOIN", vec![chan.into_string()]),
                Cmd::PART { chan, msg } => {
                    let mut args = vec![chan.into_string()];
                    args.extend(msg);
                    ("PART", args)
                }
                Cmd::NICK { nick } => ("NICK", vec![nick]),
                Cmd::TOPIC { chan, topic } => ("TOPIC", vec![chan.into_string(), topic]),
                cmd => panic!("unexpected parse: {:?}", cmd),
            };
            assert_eq!(cmd2, cmd);
            let args2_refs: Vec<&str> = args2.iter().map(|s| s.as_str()).collect();
            assert_eq!(encode(cmd2, &args2_refs), encode(cmd, &args));
        }
    }

    #[test]
    fn test_enforce_max_len() {
        let short = "PRIVMSG #x :hi\r\n".to_string();
        assert_eq!(enforce_max_len(short.clone()), short);

        let long = format!("PRIVMSG #x :{}\r\n", "a".repeat(600));
        let capped = enforce_max_len(long);
        assert_eq!(capped.len(), MAX_MSG_LEN);
        assert!(capped.ends_with("\r\n"));
    }

    #[test]
    fn test_nick_and_chan_regexes() {
        assert!(is_nick("dan"));
        assert!(is_nick("[weird]_nick"));
        assert!(!is_nick("0starts_with_digit"));
        assert!(!is_nick("seventeen_chars_xx"));
        assert!(is_chan("#rust"));
        assert!(is_chan("&local"));
        assert!(!is_chan("#"));
        assert!(!is_chan("#with space"));
        assert!(!is_chan("nohash"));
        assert!(!is_chan(&format!("#{}", "x".repeat(50))));
    }

    #[test]
    fn test_drop_nick_prefix() {
        assert_eq!(drop_nick_prefix("@op"), "op");
        assert_eq!(drop_nick_prefix("+voiced"), "voiced");
        assert_eq!(drop_nick_prefix("plain"), "plain");
    }
}
