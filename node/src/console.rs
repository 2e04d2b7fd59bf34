//! # Operator Console
//!
//! Line-oriented command surface over the hosted peers. One console drives
//! every peer on the in-process fabric; commands apply to the *active*
//! peer, switchable with `use <name>` or per-command with an `@<name>`
//! prefix.
//!
//! Command families:
//!
//! - chat: `tell`, `gtell`
//! - remote execution: `execute`, `gexecute`, `gaexecute`, and the
//!   context-channel forms `gg`/`gr`/`gz` (+`gga`/`gra`/`gza`, which also
//!   run the command locally)
//! - data: `query`, `observe`, plus `set`/`unset`/`vars` to poke the local
//!   variable store
//! - membership: `join`, `leave` (with `save`/`all` persistence)
//! - configuration: the `net` family, written through to the settings file

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::warn;

use weave_fabric::{unescape_command, Evaluator, Node, FABRIC_VERSION};

use crate::evaluator::DemoEvaluator;
use crate::settings::SettingsFile;

/// One peer hosted by this console.
pub struct HostedPeer {
    /// Short character name, used for `@` addressing and `use`.
    pub character: String,
    pub node: Node,
    pub eval: Arc<DemoEvaluator>,
}

/// Console state: the hosted peers, the active selection, and the persisted
/// settings.
pub struct Console {
    pub peers: Vec<HostedPeer>,
    pub active: usize,
    pub settings: SettingsFile,
    pub settings_path: PathBuf,
    pub quit: bool,
}

impl Console {
    pub fn new(peers: Vec<HostedPeer>, settings: SettingsFile, settings_path: PathBuf) -> Self {
        Self {
            peers,
            active: 0,
            settings,
            settings_path,
            quit: false,
        }
    }

    /// One host pulse for every hosted peer.
    pub fn tick_all(&self) {
        for peer in &self.peers {
            peer.node.tick();
        }
    }

    /// Parses and runs one console line.
    pub async fn handle_line(&mut self, line: &str) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }

        // `@<peer> <command...>` retargets a single command.
        let (index, line) = match line.strip_prefix('@') {
            Some(rest) => {
                let (name, rest) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
                match self.peer_index(name) {
                    Some(index) => (index, rest.trim()),
                    None => {
                        println!("no hosted peer named {name}");
                        return;
                    }
                }
            }
            None => (self.active, line),
        };
        if line.is_empty() {
            return;
        }

        let (verb, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
        let rest = rest.trim();
        match verb {
            "help" => print_help(),
            "quit" | "exit" => self.quit = true,
            "peers" => self.cmd_peers(index),
            "use" => self.cmd_use(rest),
            "set" => self.cmd_set(index, rest),
            "unset" => self.cmd_unset(index, rest),
            "vars" => self.cmd_vars(index),
            "info" => println!("{}", self.peers[index].node.info()),
            "net" => self.cmd_net(index, rest),
            "join" => self.cmd_join(index, rest, true),
            "leave" => self.cmd_join(index, rest, false),
            "tell" => self.cmd_tell(index, rest, false),
            "gtell" => self.cmd_tell(index, rest, true),
            "execute" => self.cmd_execute(index, rest),
            "gexecute" => self.cmd_gexecute(index, rest, false),
            "gaexecute" => self.cmd_gexecute(index, rest, true),
            "gg" => self.cmd_context_execute(index, "group_", rest, false),
            "gga" => self.cmd_context_execute(index, "group_", rest, true),
            "gr" => self.cmd_context_execute(index, "raid_", rest, false),
            "gra" => self.cmd_context_execute(index, "raid_", rest, true),
            "gz" => self.cmd_context_execute(index, "zone_", rest, false),
            "gza" => self.cmd_context_execute(index, "zone_", rest, true),
            "observe" => self.cmd_observe(index, rest),
            "query" => self.cmd_query(index, rest).await,
            _ => println!("unknown command: {verb} (try `help`)"),
        }
    }

    fn peer_index(&self, name: &str) -> Option<usize> {
        let name = name.to_lowercase();
        self.peers
            .iter()
            .position(|p| p.character == name || p.node.name() == name)
    }

    fn persist(&mut self) {
        // Every hosted node shares the settings file; snapshot the active
        // node's view as the canonical one.
        self.settings.general.net = self.peers[self.active].node.settings();
        if let Err(err) = self.settings.save(&self.settings_path) {
            warn!(%err, "failed to persist settings");
        }
    }

    fn update_all_settings(&self, f: impl Fn(&mut weave_fabric::NetSettings)) {
        for peer in &self.peers {
            peer.node.update_settings(&f);
        }
    }

    // -- peer selection -----------------------------------------------------

    fn cmd_peers(&self, index: usize) {
        for (i, peer) in self.peers.iter().enumerate() {
            let marker = if i == self.active { "*" } else { " " };
            println!("{marker} {} ({})", peer.character, peer.node.name());
        }
        println!("fabric: {}", self.peers[index].node.peers().join(", "));
    }

    fn cmd_use(&mut self, name: &str) {
        match self.peer_index(name) {
            Some(index) => {
                self.active = index;
                println!("active peer: {}", self.peers[index].node.name());
            }
            None => println!("no hosted peer named {name}"),
        }
    }

    // -- local variable store -----------------------------------------------

    fn cmd_set(&self, index: usize, rest: &str) {
        match rest.split_once(' ') {
            Some((name, value)) => self.peers[index].eval.set(name, value.trim()),
            None => println!("usage: set <var> <value>"),
        }
    }

    fn cmd_unset(&self, index: usize, rest: &str) {
        if rest.is_empty() {
            println!("usage: unset <var>");
        } else {
            self.peers[index].eval.unset(rest);
        }
    }

    fn cmd_vars(&self, index: usize) {
        for (name, value) in self.peers[index].eval.vars() {
            println!("{name} = {value}");
        }
    }

    // -- membership -----------------------------------------------------------

    fn cmd_join(&mut self, index: usize, rest: &str, joining: bool) {
        let mut parts = rest.split_whitespace();
        let Some(group) = parts.next() else {
            println!("usage: {} <group> [save|all]", if joining { "join" } else { "leave" });
            return;
        };
        let group = group.to_lowercase();
        let scope = parts.next().unwrap_or("");

        match scope {
            "all" => {
                for peer in &self.peers {
                    if joining {
                        peer.node.join(&group);
                    } else {
                        peer.node.leave(&group);
                    }
                }
                if joining {
                    self.settings.save_group(None, &group);
                } else {
                    self.settings.unsave_group(None, &group);
                }
                self.persist();
            }
            "save" => {
                let full = self.peers[index].node.name().to_string();
                if joining {
                    self.peers[index].node.join(&group);
                    self.settings.save_group(Some(&full), &group);
                } else {
                    self.peers[index].node.leave(&group);
                    self.settings.unsave_group(Some(&full), &group);
                }
                self.persist();
            }
            "" => {
                if joining {
                    self.peers[index].node.join(&group);
                } else {
                    self.peers[index].node.leave(&group);
                }
            }
            other => println!("unknown scope {other} (expected save or all)"),
        }
    }

    // -- chat -----------------------------------------------------------------

    fn cmd_tell(&self, index: usize, rest: &str, group: bool) {
        let Some((target, message)) = rest.split_once(' ') else {
            println!(
                "usage: {} <{}> <message>",
                if group { "gtell" } else { "tell" },
                if group { "group" } else { "target" }
            );
            return;
        };
        let node = &self.peers[index].node;
        if group {
            node.tell_group(target, message.trim());
        } else {
            node.tell(target, message.trim());
        }
    }

    // -- remote execution ------------------------------------------------------

    fn cmd_execute(&self, index: usize, rest: &str) {
        let Some((target, command)) = rest.split_once(' ') else {
            println!("usage: execute <target> <command>");
            return;
        };
        self.peers[index].node.execute(target, command.trim());
    }

    fn cmd_gexecute(&self, index: usize, rest: &str, also_local: bool) {
        let Some((group, command)) = rest.split_once(' ') else {
            println!("usage: g{}execute <group> <command>", if also_local { "a" } else { "" });
            return;
        };
        let command = command.trim();
        self.peers[index].node.execute_group(group, command);
        if also_local {
            self.peers[index].eval.execute(&unescape_command(command));
        }
    }

    /// The `gg`/`gr`/`gz` family: shout an Execute at the contextual channel
    /// for the current group leader, raid leader, or zone.
    fn cmd_context_execute(&self, index: usize, prefix: &str, command: &str, also_local: bool) {
        if command.is_empty() {
            println!("usage: {prefix}-form <command>");
            return;
        }
        let peer = &self.peers[index];
        let suffix = match prefix {
            "group_" => peer.eval.get("Group.Leader").map(|l| peer.node.full_name(&l)),
            "raid_" => peer.eval.get("Raid.Leader").map(|l| peer.node.full_name(&l)),
            _ => peer.eval.get("Zone.ShortName").map(|z| z.to_lowercase()),
        };
        let Some(suffix) = suffix else {
            println!("no context for {prefix} channel");
            return;
        };
        let group = format!("{prefix}{suffix}");
        peer.node.execute_group(&group, command);
        if also_local {
            peer.eval.execute(&unescape_command(command));
        }
    }

    // -- query & observe -------------------------------------------------------

    fn cmd_observe(&self, index: usize, rest: &str) {
        let Some(spec) = parse_query_spec(rest) else {
            println!("usage: observe <target> -q <expr> [-o <sink>] [-d]");
            return;
        };
        let node = &self.peers[index].node;
        if spec.drop {
            node.forget(&spec.target, &spec.expr);
            println!("dropped observation of {} on {}", spec.expr, spec.target);
        } else {
            node.observe(&spec.target, &spec.expr, spec.sink.as_deref());
        }
    }

    async fn cmd_query(&self, index: usize, rest: &str) {
        let Some(spec) = parse_query_spec(rest) else {
            println!("usage: query <target> -q <expr> [-o <sink>] [-t <ms>]");
            return;
        };
        let node = self.peers[index].node.clone();
        node.query(&spec.target, &spec.expr, spec.sink.as_deref());

        let timeout = Duration::from_millis(
            spec.timeout_ms.unwrap_or(node.settings().query_timeout_ms),
        );
        let deadline = Instant::now() + timeout;
        loop {
            self.tick_all();
            if let Some(obs) = node.read_query(&spec.target, &spec.expr) {
                if obs.received_at > 0 {
                    println!("{} @ {} -> {}", spec.expr, spec.target, obs.value);
                    return;
                }
            }
            if Instant::now() > deadline {
                println!("query timed out after {} ms", timeout.as_millis());
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    // -- net ------------------------------------------------------------------

    fn cmd_net(&mut self, index: usize, rest: &str) {
        let mut parts = rest.split_whitespace();
        let sub = parts.next().unwrap_or("info");
        let arg = parts.next();

        let toggle = |current: bool| match arg {
            Some("on") => true,
            Some("off") => false,
            _ => !current,
        };

        let node = self.peers[index].node.clone();
        let settings = node.settings();
        match sub {
            "info" => println!("{}", node.info()),
            "version" => println!("weave-fabric {FABRIC_VERSION}"),
            "interface" => match arg {
                Some("clear") => {
                    self.update_all_settings(|s| s.interface = None);
                    self.persist();
                }
                Some(name) => {
                    let name = name.to_string();
                    self.update_all_settings(move |s| s.interface = Some(name.clone()));
                    self.persist();
                    println!("interface set; takes effect on next enter");
                }
                None => println!(
                    "interface: {}",
                    settings.interface.as_deref().unwrap_or("(default)")
                ),
            },
            "debug" => {
                let v = toggle(settings.debugging);
                self.update_all_settings(move |s| s.debugging = v);
                self.persist();
                println!("debug {}", if v { "on" } else { "off" });
            }
            "localecho" => {
                let v = toggle(settings.local_echo);
                self.update_all_settings(move |s| s.local_echo = v);
                self.persist();
            }
            "commandecho" => {
                let v = toggle(settings.command_echo);
                self.update_all_settings(move |s| s.command_echo = v);
                self.persist();
            }
            "fullnames" => {
                let v = toggle(settings.full_names);
                self.update_all_settings(move |s| s.full_names = v);
                self.persist();
            }
            "frontdelim" => {
                let v = toggle(settings.front_delimiter);
                self.update_all_settings(move |s| s.front_delimiter = v);
                self.persist();
            }
            "showgroups" => {
                let v = toggle(settings.show_groups);
                self.update_all_settings(move |s| s.show_groups = v);
                self.persist();
            }
            "evasiverefresh" => {
                let v = toggle(settings.evasive_refresh);
                self.update_all_settings(move |s| s.evasive_refresh = v);
                self.persist();
            }
            "timeout" | "observedelay" | "evasive" | "expired" | "keepalive" => {
                let Some(ms) = arg.and_then(|a| a.parse::<u64>().ok()) else {
                    println!("usage: net {sub} <ms>");
                    return;
                };
                let sub = sub.to_string();
                self.update_all_settings(move |s| match sub.as_str() {
                    "timeout" => s.query_timeout_ms = ms,
                    "observedelay" => s.observe_delay_ms = ms,
                    "evasive" => s.evasive_ms = ms,
                    "expired" => s.expired_ms = ms,
                    _ => s.keepalive_ms = ms,
                });
                self.persist();
            }
            other => println!("unknown net subcommand: {other}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Query/observe argument parsing
// ---------------------------------------------------------------------------

#[derive(Debug, PartialEq, Eq)]
struct QuerySpec {
    target: String,
    expr: String,
    sink: Option<String>,
    timeout_ms: Option<u64>,
    drop: bool,
}

/// Parses `<target> -q <expr...> [-o <sink>] [-t <ms>] [-d]`. The
/// expression runs until the next flag token, so spaces inside it survive.
fn parse_query_spec(rest: &str) -> Option<QuerySpec> {
    let tokens: Vec<&str> = rest.split_whitespace().collect();
    let (&target, mut tokens) = tokens.split_first()?;
    if target.starts_with('-') {
        return None;
    }

    let mut expr: Vec<&str> = Vec::new();
    let mut sink = None;
    let mut timeout_ms = None;
    let mut drop = false;

    while let Some((&flag, rest_tokens)) = tokens.split_first() {
        tokens = rest_tokens;
        match flag {
            "-q" => {
                while let Some((&tok, rest_tokens)) = tokens.split_first() {
                    if tok.starts_with('-') && tok.len() == 2 {
                        break;
                    }
                    expr.push(tok);
                    tokens = rest_tokens;
                }
            }
            "-o" => {
                let (&value, rest_tokens) = tokens.split_first()?;
                sink = Some(value.to_string());
                tokens = rest_tokens;
            }
            "-t" => {
                let (&value, rest_tokens) = tokens.split_first()?;
                timeout_ms = Some(value.parse().ok()?);
                tokens = rest_tokens;
            }
            "-d" => drop = true,
            _ => return None,
        }
    }

    if expr.is_empty() {
        return None;
    }
    Some(QuerySpec {
        target: target.to_string(),
        expr: expr.join(" "),
        sink,
        timeout_ms,
        drop,
    })
}

fn print_help() {
    println!(
        "\
commands (prefix with @<peer> to retarget):
  peers                         list hosted peers and the fabric roster
  use <peer>                    switch the active peer
  set/unset/vars                poke the local variable store
  join|leave <group> [save|all] group membership (+persistence)
  tell <target> <msg>           whisper a chat line
  gtell <group> <msg>           shout a chat line
  execute <target> <cmd>        run a command on one peer
  gexecute <group> <cmd>        run a command on a group (gaexecute: +local)
  gg/gr/gz <cmd>                run on group_/raid_/zone_ channel (+a: local)
  query <target> -q <expr> [-o <sink>] [-t <ms>]
  observe <target> -q <expr> [-o <sink>] [-d]
  net <sub> [arg]               flags, timeouts, info, version
  info | help | quit"
    );
}
