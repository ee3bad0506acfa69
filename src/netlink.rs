//! Kernel link and policy-rule operations
//!
//! Thin rtnetlink wrappers plus the pure planning logic for idempotent rule
//! installation. All operations are best-effort at the call sites: a failed
//! rule or link call is logged and retried on the next maintenance tick.

use anyhow::Result;
use ipnet::Ipv4Net;
use std::net::Ipv4Addr;
use std::path::Path;

/// NIC name patterns the agent must never delete. A trailing '*' matches any
/// suffix; anything else is an exact match.
const PROTECTED_NIC_PATTERNS: &[&str] = &[
    "eth*", "ens*", "eno*", "enp*", "lo", "docker0", "br-*", "veth*", "cali*", "flannel*",
    "cni0", "weave*",
];

/// Whether a link name is on the deny list (or in the extra protected set).
pub fn is_protected_nic(name: &str, extra_protected: &[&str]) -> bool {
    if extra_protected.contains(&name) {
        return true;
    }
    PROTECTED_NIC_PATTERNS.iter().any(|pattern| {
        match pattern.strip_suffix('*') {
            Some(prefix) => name.starts_with(prefix),
            None => name == *pattern,
        }
    })
}

/// Check link existence via sysfs; cheaper than a netlink dump.
pub fn interface_exists(name: &str) -> bool {
    if name.is_empty() {
        return false;
    }
    Path::new("/sys/class/net").join(name).exists()
}

/// A policy rule the supervisor wants installed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesiredRule {
    pub priority: u32,
    pub table: u32,
    pub src: Option<Ipv4Net>,
    pub dst: Option<Ipv4Net>,
}

/// A rule as observed in the kernel, reduced to the fields we match on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservedRule {
    pub priority: u32,
    pub table: u32,
    pub src: Option<(Ipv4Addr, u8)>,
    pub dst: Option<(Ipv4Addr, u8)>,
}

/// What to do about one desired rule given the current rule table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RulePlan {
    /// An exact match already exists; skip the add.
    pub already_installed: bool,
    /// Stale rules with the same priority/table whose source sits in the
    /// same /16 as the desired source but differs from it. These are left
    /// over from a mesh-IP change and must go before the add.
    pub stale: Vec<ObservedRule>,
}

impl DesiredRule {
    fn matches(&self, observed: &ObservedRule) -> bool {
        observed.priority == self.priority
            && observed.table == self.table
            && observed.src == self.src.map(|n| (n.addr(), n.prefix_len()))
            && observed.dst == self.dst.map(|n| (n.addr(), n.prefix_len()))
    }
}

/// Decide skip/delete/add for one desired rule. Pure so it can be tested
/// without a kernel.
pub fn plan_rule(desired: &DesiredRule, existing: &[ObservedRule]) -> RulePlan {
    let already_installed = existing.iter().any(|rule| desired.matches(rule));

    let mut stale = Vec::new();
    if let Some(want_src) = desired.src {
        let want_block = Ipv4Net::new(want_src.addr(), 16)
            .map(|n| n.trunc())
            .ok();
        for rule in existing {
            if rule.priority != desired.priority || rule.table != desired.table {
                continue;
            }
            let Some((addr, len)) = rule.src else { continue };
            if (addr, len) == (want_src.addr(), want_src.prefix_len()) {
                continue;
            }
            let same_block = want_block
                .map(|block| block.contains(&addr))
                .unwrap_or(false);
            if same_block {
                stale.push(rule.clone());
            }
        }
    }

    RulePlan {
        already_installed,
        stale,
    }
}

#[cfg(target_os = "linux")]
mod imp {
    use super::{DesiredRule, ObservedRule};
    use anyhow::{Context, Result};
    use futures::TryStreamExt;
    use netlink_packet_route::rule::{RuleAction, RuleAttribute, RuleMessage};
    use netlink_packet_route::AddressFamily;
    use rtnetlink::{Handle, IpVersion};
    use std::net::IpAddr;
    use tracing::debug;

    fn observe(message: &RuleMessage) -> Option<(ObservedRule, RuleMessage)> {
        if message.header.family != AddressFamily::Inet {
            return None;
        }
        let mut priority = 0u32;
        let mut table = message.header.table as u32;
        let mut src = None;
        let mut dst = None;

        for attr in &message.attributes {
            match attr {
                RuleAttribute::Priority(p) => priority = *p,
                RuleAttribute::Table(t) => table = *t,
                RuleAttribute::Source(IpAddr::V4(addr)) => {
                    src = Some((*addr, message.header.src_len));
                }
                RuleAttribute::Destination(IpAddr::V4(addr)) => {
                    dst = Some((*addr, message.header.dst_len));
                }
                _ => {}
            }
        }

        Some((
            ObservedRule {
                priority,
                table,
                src,
                dst,
            },
            message.clone(),
        ))
    }

    /// Dump the kernel's IPv4 rules with their raw messages (needed for del).
    pub async fn list_rules(handle: &Handle) -> Result<Vec<(ObservedRule, RuleMessage)>> {
        let mut rules = handle.rule().get(IpVersion::V4).execute();
        let mut observed = Vec::new();
        while let Some(message) = rules.try_next().await.context("rule dump failed")? {
            if let Some(pair) = observe(&message) {
                observed.push(pair);
            }
        }
        Ok(observed)
    }

    pub async fn add_rule(handle: &Handle, desired: &DesiredRule) -> Result<()> {
        let mut request = handle
            .rule()
            .add()
            .v4()
            .table_id(desired.table)
            .priority(desired.priority)
            .action(RuleAction::ToTable);
        if let Some(src) = desired.src {
            request = request.source_prefix(src.addr(), src.prefix_len());
        }
        if let Some(dst) = desired.dst {
            request = request.destination_prefix(dst.addr(), dst.prefix_len());
        }
        request.execute().await.context("rule add failed")?;
        debug!("Installed rule priority={} table={}", desired.priority, desired.table);
        Ok(())
    }

    pub async fn del_rule(handle: &Handle, message: RuleMessage) -> Result<()> {
        handle
            .rule()
            .del(message)
            .execute()
            .await
            .context("rule del failed")
    }

    /// Delete a link by name. Callers check the protected list first.
    pub async fn delete_link(handle: &Handle, name: &str) -> Result<()> {
        let mut links = handle.link().get().match_name(name.to_string()).execute();
        let link = links
            .try_next()
            .await
            .context("link lookup failed")?
            .with_context(|| format!("link {} not found", name))?;
        handle
            .link()
            .del(link.header.index)
            .execute()
            .await
            .with_context(|| format!("failed to delete link {}", name))
    }

    /// Open a netlink connection; the connection task runs until dropped.
    pub fn connect() -> Result<Handle> {
        let (connection, handle, _) =
            rtnetlink::new_connection().context("netlink connection failed")?;
        tokio::spawn(connection);
        Ok(handle)
    }
}

#[cfg(target_os = "linux")]
pub use imp::{add_rule, connect, del_rule, delete_link, list_rules};

/// Install one rule idempotently: skip on exact match, first clearing stale
/// same-/16 leftovers from a mesh-IP change.
#[cfg(target_os = "linux")]
pub async fn ensure_rule(handle: &rtnetlink::Handle, desired: &DesiredRule) -> Result<()> {
    let existing = list_rules(handle).await?;
    let observed: Vec<ObservedRule> = existing.iter().map(|(o, _)| o.clone()).collect();
    let plan = plan_rule(desired, &observed);

    for stale in &plan.stale {
        if let Some((_, message)) = existing.iter().find(|(o, _)| o == stale) {
            if let Err(e) = del_rule(handle, message.clone()).await {
                tracing::warn!(
                    "Failed to delete stale rule priority={} table={}: {:#}",
                    stale.priority,
                    stale.table,
                    e
                );
            }
        }
    }

    if !plan.already_installed {
        add_rule(handle, desired).await?;
    }
    Ok(())
}

/// Remove one rule if present.
#[cfg(target_os = "linux")]
pub async fn remove_rule(handle: &rtnetlink::Handle, desired: &DesiredRule) -> Result<()> {
    let existing = list_rules(handle).await?;
    for (observed, message) in existing {
        if desired.matches(&observed) {
            del_rule(handle, message).await?;
        }
    }
    Ok(())
}
