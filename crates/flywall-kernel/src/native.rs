//! Native Linux datapath binding
//!
//! Binds the host conntrack table, the named-counter facility and the
//! blocklist address set by driving `conntrack` and `nft`. Rulesets are
//! fed to `nft -f -` as one script, which the kernel applies as a single
//! transaction: on any error the prior ruleset stays active.

use std::collections::HashMap;
use std::io::Write;
use std::net::IpAddr;
use std::process::{Command, Stdio};
use std::sync::Arc;

use flywall_common::{proto, Clock, Error, FlowKey, ProtocolState, Result};
use tracing::{debug, warn};

use crate::conntrack::Flow;
use crate::ruleset::Ruleset;
use crate::Kernel;

/// Kernel backend bound to the running host.
pub struct NativeKernel {
    clock: Arc<dyn Clock>,
    table: String,
    blocklist_set: String,
}

impl NativeKernel {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            table: "flywall".to_string(),
            blocklist_set: "blocklist".to_string(),
        }
    }

    fn run(&self, program: &str, args: &[&str], stdin: Option<&str>) -> Result<String> {
        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|e| {
            Error::unavailable(format!("failed to spawn {program}: {e}"))
                .with_attr("program", program)
        })?;

        if let Some(input) = stdin {
            if let Some(mut pipe) = child.stdin.take() {
                pipe.write_all(input.as_bytes())?;
            }
        }

        let output = child.wait_with_output()?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::internal(format!("{program} exited with failure"))
                .with_attr("program", program)
                .with_attr("status", output.status.to_string())
                .with_attr("stderr", stderr.trim().to_string()));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl Kernel for NativeKernel {
    fn dump_flows(&self) -> Result<Vec<Flow>> {
        // An absent conntrack table is an empty dump, not an error.
        let output = match self.run("conntrack", &["-L"], None) {
            Ok(out) => out,
            Err(e) => {
                debug!(error = %e, "conntrack dump unavailable");
                return Ok(Vec::new());
            }
        };
        let now = self.now();
        Ok(output
            .lines()
            .filter_map(|line| parse_conntrack_line(line, now))
            .collect())
    }

    fn get_flow(&self, id: u64) -> Result<Option<Flow>> {
        Ok(self.dump_flows()?.into_iter().find(|f| f.id == id))
    }

    fn kill_flow(&self, id: u64) -> Result<bool> {
        let Some(flow) = self.get_flow(id)? else {
            return Ok(false);
        };
        let src = flow.key.src_ip.to_string();
        let dst = flow.key.dst_ip.to_string();
        let proto_name = proto::name(flow.key.proto);
        self.run(
            "conntrack",
            &["-D", "-s", &src, "-d", &dst, "-p", proto_name],
            None,
        )?;
        Ok(true)
    }

    fn add_block(&self, ip: IpAddr) -> Result<()> {
        let element = format!("{{ {ip} }}");
        self.run(
            "nft",
            &[
                "add",
                "element",
                "inet",
                &self.table,
                &self.blocklist_set,
                &element,
            ],
            None,
        )?;
        Ok(())
    }

    fn remove_block(&self, ip: IpAddr) -> Result<()> {
        let element = format!("{{ {ip} }}");
        // Deleting an absent element is not an error for callers.
        if let Err(e) = self.run(
            "nft",
            &[
                "delete",
                "element",
                "inet",
                &self.table,
                &self.blocklist_set,
                &element,
            ],
            None,
        ) {
            debug!(error = %e, %ip, "blocklist element delete skipped");
        }
        Ok(())
    }

    fn is_blocked(&self, ip: IpAddr) -> Result<bool> {
        let output = match self.run(
            "nft",
            &["-j", "list", "set", "inet", &self.table, &self.blocklist_set],
            None,
        ) {
            Ok(out) => out,
            Err(_) => return Ok(false),
        };
        Ok(parse_set_elements(&output)?.contains(&ip.to_string()))
    }

    fn now(&self) -> u64 {
        self.clock.now_ns()
    }

    fn counters(&self) -> Result<HashMap<String, u64>> {
        let output = match self.run("nft", &["-j", "list", "counters"], None) {
            Ok(out) => out,
            Err(e) => {
                debug!(error = %e, "counter listing unavailable");
                return Ok(HashMap::new());
            }
        };
        parse_counters(&output)
    }

    fn apply_ruleset(&self, ruleset: &Ruleset) -> Result<()> {
        let script = ruleset.render();
        match self.run("nft", &["-f", "-"], Some(&script)) {
            Ok(_) => {
                debug!(table = %ruleset.table, chains = ruleset.chains.len(), "ruleset applied");
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "ruleset apply rejected; prior ruleset remains active");
                Err(e)
            }
        }
    }
}

/// Parse one `conntrack -L` line into a flow.
///
/// Typical line:
/// `tcp 6 431999 ESTABLISHED src=10.0.0.5 dst=1.2.3.4 sport=44321 dport=443
///  packets=12 bytes=3400 src=1.2.3.4 dst=10.0.0.5 sport=443 dport=44321 ...`
fn parse_conntrack_line(line: &str, now_ns: u64) -> Option<Flow> {
    let mut tokens = line.split_whitespace();
    tokens.next()?; // protocol name
    let proto_num: u8 = tokens.next()?.parse().ok()?;

    let mut state = match proto_num {
        proto::TCP => ProtocolState::New,
        _ => ProtocolState::Established,
    };
    let mut src: Option<IpAddr> = None;
    let mut dst: Option<IpAddr> = None;
    let mut sport = 0u16;
    let mut dport = 0u16;
    let mut packets = 0u64;
    let mut bytes = 0u64;

    for tok in tokens {
        match tok {
            "ESTABLISHED" => state = ProtocolState::Established,
            "TIME_WAIT" | "CLOSE" | "CLOSE_WAIT" | "FIN_WAIT" | "LAST_ACK" => {
                state = ProtocolState::Closed
            }
            "SYN_SENT" | "SYN_RECV" => state = ProtocolState::New,
            _ => {
                // Only the original direction (first occurrence) counts.
                if let Some(v) = tok.strip_prefix("src=") {
                    if src.is_none() {
                        src = v.parse().ok();
                    }
                } else if let Some(v) = tok.strip_prefix("dst=") {
                    if dst.is_none() {
                        dst = v.parse().ok();
                    }
                } else if let Some(v) = tok.strip_prefix("sport=") {
                    if sport == 0 {
                        sport = v.parse().unwrap_or(0);
                    }
                } else if let Some(v) = tok.strip_prefix("dport=") {
                    if dport == 0 {
                        dport = v.parse().unwrap_or(0);
                    }
                } else if let Some(v) = tok.strip_prefix("packets=") {
                    if packets == 0 {
                        packets = v.parse().unwrap_or(0);
                    }
                } else if let Some(v) = tok.strip_prefix("bytes=") {
                    if bytes == 0 {
                        bytes = v.parse().unwrap_or(0);
                    }
                }
            }
        }
    }

    let key = FlowKey::new(src?, dst?, sport, dport, proto_num, 0);
    let mut flow = Flow::new(key, state, now_ns);
    flow.packets = packets;
    flow.bytes = bytes;
    Some(flow)
}

/// Extract named counters from `nft -j list counters` output.
fn parse_counters(json: &str) -> Result<HashMap<String, u64>> {
    let value: serde_json::Value = serde_json::from_str(json)?;
    let mut out = HashMap::new();
    let Some(items) = value.get("nftables").and_then(|v| v.as_array()) else {
        return Ok(out);
    };
    for item in items {
        let Some(counter) = item.get("counter") else {
            continue;
        };
        let Some(name) = counter.get("name").and_then(|v| v.as_str()) else {
            continue;
        };
        let packets = counter
            .get("packets")
            .and_then(|v| v.as_u64())
            .unwrap_or(0);
        out.insert(name.to_string(), packets);
    }
    Ok(out)
}

/// Extract element addresses from `nft -j list set` output.
fn parse_set_elements(json: &str) -> Result<Vec<String>> {
    let value: serde_json::Value = serde_json::from_str(json)?;
    let mut out = Vec::new();
    let Some(items) = value.get("nftables").and_then(|v| v.as_array()) else {
        return Ok(out);
    };
    for item in items {
        let Some(set) = item.get("set") else {
            continue;
        };
        let Some(elems) = set.get("elem").and_then(|v| v.as_array()) else {
            continue;
        };
        for elem in elems {
            if let Some(s) = elem.as_str() {
                out.push(s.to_string());
            } else if let Some(s) = elem
                .get("elem")
                .and_then(|e| e.get("val"))
                .and_then(|v| v.as_str())
            {
                out.push(s.to_string());
            }
        }
    }
    Ok(out)
}
