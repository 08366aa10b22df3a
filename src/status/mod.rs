//! Town snapshot builder.
//!
//! [`StatusBuilder::build`] aggregates the session registry, the bead stores
//! and the mailboxes into one [`TownStatus`]:
//!
//! 1. Load `town.kdl` softly (a broken config yields a default one).
//! 2. List live sessions once; that set is the only liveness oracle.
//! 3. Discover rigs. Failure here is the only fatal error.
//! 4. Prefetch every rig's agent beads and, in one batch per rig, their
//!    hook beads.
//! 5. Build the global agents and each rig's status on scoped threads, each
//!    writing only its own slot.
//! 6. Sum the summary sequentially from the finished rig slots.
//!
//! Fast mode skips mail counts and is what the change detector polls.

pub mod convoys;

pub use convoys::{ConvoyBlocker, ConvoyInfo, ConvoyMember, ConvoyReader, ConvoyStatusFilter};

use crate::config::{self, TownConfig};
use crate::mail::{JsonlMailRouter, MAYOR_ADDRESS, MailRouter};
use crate::models::{AgentRole, Issue};
use crate::rig::{Rig, RigManager};
use crate::storage::{JsonlStoreProvider, StoreProvider};
use crate::tmux::{self, SessionRegistry, Tmux};
use crate::Result;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Mailbox address of the human overseer.
pub const OVERSEER_ADDRESS: &str = "overseer";

/// Point-in-time view of the whole town.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TownStatus {
    pub name: String,
    pub location: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub overseer: Option<OverseerInfo>,
    /// Town-wide agents (mayor, deacon) with a live session
    pub agents: Vec<AgentRuntime>,
    pub rigs: Vec<RigStatus>,
    pub summary: StatusSummary,
}

/// The human operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OverseerInfo {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Where the identity came from ("town.kdl", "env:USER")
    pub source: String,
    pub unread_mail: usize,
}

/// Runtime state of one agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AgentRuntime {
    pub name: String,
    pub address: String,
    pub session: String,
    pub role: AgentRole,
    pub running: bool,
    pub has_work: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub work_title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hook_bead: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    pub unread_mail: usize,
}

impl AgentRuntime {
    fn new(name: &str, address: String, session: String, role: AgentRole, running: bool) -> Self {
        Self {
            name: name.to_string(),
            address,
            session,
            role,
            running,
            has_work: false,
            work_title: None,
            hook_bead: None,
            state: None,
            unread_mail: 0,
        }
    }
}

/// Status of one rig.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RigStatus {
    pub name: String,
    pub path: String,
    pub polecats: Vec<String>,
    pub polecat_count: usize,
    pub crews: Vec<String>,
    pub crew_count: usize,
    pub has_witness: bool,
    pub has_refinery: bool,
    /// Agents of this rig with a hook bead
    pub active_hooks: usize,
    pub agents: Vec<AgentRuntime>,
}

/// Town-wide counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusSummary {
    pub rig_count: usize,
    pub polecat_count: usize,
    pub crew_count: usize,
    pub witness_count: usize,
    pub refinery_count: usize,
    pub active_hooks: usize,
}

impl StatusSummary {
    /// Sum the counts of finished rig statuses.
    pub fn from_rigs(rigs: &[RigStatus]) -> Self {
        let mut summary = Self::default();
        for rig in rigs {
            summary.rig_count += 1;
            summary.polecat_count += rig.polecat_count;
            summary.crew_count += rig.crew_count;
            if rig.has_witness {
                summary.witness_count += 1;
            }
            if rig.has_refinery {
                summary.refinery_count += 1;
            }
            summary.active_hooks += rig.active_hooks;
        }
        summary
    }
}

impl TownStatus {
    /// Every agent: global ones first, then each rig's in rig order.
    pub fn all_agents(&self) -> impl Iterator<Item = &AgentRuntime> {
        self.agents
            .iter()
            .chain(self.rigs.iter().flat_map(|rig| rig.agents.iter()))
    }

    /// Find an agent by address, or a global agent by bare name.
    pub fn find_agent(&self, address: &str) -> Option<&AgentRuntime> {
        let address = address.trim_end_matches('/');
        self.all_agents().find(|a| a.address == address).or_else(|| {
            self.agents.iter().find(|a| a.name == address)
        })
    }

    pub fn find_rig(&self, name: &str) -> Option<&RigStatus> {
        self.rigs.iter().find(|rig| rig.name == name)
    }
}

/// Agent and hook beads prefetched for one rig.
#[derive(Debug, Default)]
struct RigBeads {
    agents: HashMap<String, Issue>,
    hooks: HashMap<String, Issue>,
}

/// Builds [`TownStatus`] snapshots from the adapters.
pub struct StatusBuilder {
    town_root: PathBuf,
    sessions: Arc<dyn SessionRegistry>,
    stores: Arc<dyn StoreProvider>,
    mail: Arc<dyn MailRouter>,
}

impl StatusBuilder {
    pub fn new(
        town_root: impl Into<PathBuf>,
        sessions: Arc<dyn SessionRegistry>,
        stores: Arc<dyn StoreProvider>,
        mail: Arc<dyn MailRouter>,
    ) -> Self {
        Self {
            town_root: town_root.into(),
            sessions,
            stores,
            mail,
        }
    }

    /// Builder over tmux, JSONL bead stores and JSONL mailboxes.
    pub fn for_town(town_root: &Path) -> Self {
        Self::new(
            town_root,
            Arc::new(Tmux::new()),
            Arc::new(JsonlStoreProvider),
            Arc::new(JsonlMailRouter::new(town_root)),
        )
    }

    pub fn town_root(&self) -> &Path {
        &self.town_root
    }

    pub fn stores(&self) -> &Arc<dyn StoreProvider> {
        &self.stores
    }

    pub fn mail(&self) -> &Arc<dyn MailRouter> {
        &self.mail
    }

    /// Current town config, falling back to defaults.
    pub fn load_config(&self) -> TownConfig {
        config::load_town_config_soft(&self.town_root)
    }

    /// Build a snapshot. Fails only when rig discovery fails.
    pub fn build(&self, fast: bool) -> Result<TownStatus> {
        let config = self.load_config();

        let live = match self.sessions.list_sessions() {
            Ok(live) => live,
            Err(e) => {
                tracing::warn!(error = %e, "session registry unavailable, treating all agents as stopped");
                HashSet::new()
            }
        };

        let rigs = RigManager::new(&self.town_root, &config).discover_rigs()?;

        let prefetched: Vec<RigBeads> = rigs.iter().map(|rig| self.prefetch_rig(rig)).collect();

        let overseer = config::resolve_overseer(config.overseer.as_ref()).map(|resolved| {
            let overseer = resolved.value;
            OverseerInfo {
                name: overseer
                    .name
                    .clone()
                    .or_else(|| overseer.username.clone())
                    .unwrap_or_default(),
                email: overseer.email,
                username: overseer.username,
                source: resolved.source.to_string(),
                unread_mail: if fast {
                    0
                } else {
                    self.unread_mail(OVERSEER_ADDRESS)
                },
            }
        });

        let mut global_slot: Vec<AgentRuntime> = Vec::new();
        let mut rig_slots: Vec<Option<RigStatus>> = vec![None; rigs.len()];
        let live = &live;

        std::thread::scope(|scope| {
            scope.spawn(|| {
                global_slot = self.global_agents(live, fast);
            });
            for ((slot, rig), beads) in rig_slots.iter_mut().zip(&rigs).zip(&prefetched) {
                scope.spawn(move || {
                    *slot = Some(self.rig_status(rig, beads, live, fast));
                });
            }
        });

        let rig_statuses: Vec<RigStatus> = rig_slots.into_iter().flatten().collect();
        let summary = StatusSummary::from_rigs(&rig_statuses);

        Ok(TownStatus {
            name: config.name.unwrap_or_default(),
            location: self.town_root.display().to_string(),
            overseer,
            agents: global_slot,
            rigs: rig_statuses,
            summary,
        })
    }

    /// Agent beads of a rig plus one batched lookup of their hooks.
    fn prefetch_rig(&self, rig: &Rig) -> RigBeads {
        let store = self.stores.open(&rig.path);
        let agents = match store.list_agent_beads() {
            Ok(agents) => agents,
            Err(e) => {
                tracing::debug!(rig = %rig.name, error = %e, "no agent beads");
                return RigBeads::default();
            }
        };

        let mut hook_ids: Vec<String> = agents.values().filter_map(Issue::hook_bead).collect();
        hook_ids.sort();
        hook_ids.dedup();

        let hooks = if hook_ids.is_empty() {
            HashMap::new()
        } else {
            store.show_batch(&hook_ids).unwrap_or_else(|e| {
                tracing::debug!(rig = %rig.name, error = %e, "hook lookup failed");
                HashMap::new()
            })
        };

        RigBeads { agents, hooks }
    }

    fn unread_mail(&self, address: &str) -> usize {
        match self.mail.count(address) {
            Ok(count) => count.unread,
            Err(e) => {
                tracing::debug!(address, error = %e, "mail count failed");
                0
            }
        }
    }

    /// Mayor and deacon, when their sessions are live.
    fn global_agents(&self, live: &HashSet<String>, fast: bool) -> Vec<AgentRuntime> {
        [
            (MAYOR_ADDRESS, tmux::MAYOR_SESSION, AgentRole::Mayor),
            ("deacon", tmux::DEACON_SESSION, AgentRole::Deacon),
        ]
        .into_iter()
        .filter(|(_, session, _)| live.contains(*session))
        .map(|(name, session, role)| {
            let mut agent =
                AgentRuntime::new(name, name.to_string(), session.to_string(), role, true);
            if !fast {
                agent.unread_mail = self.unread_mail(name);
            }
            agent
        })
        .collect()
    }

    fn rig_status(
        &self,
        rig: &Rig,
        beads: &RigBeads,
        live: &HashSet<String>,
        fast: bool,
    ) -> RigStatus {
        let mut agents = Vec::new();
        let mut active_hooks = 0;

        let workers = rig
            .polecats
            .iter()
            .map(|name| (name, AgentRole::Polecat))
            .chain(rig.crew.iter().map(|name| (name, AgentRole::Crew)));

        for (name, role) in workers {
            let session = tmux::rig_agent_session(&rig.name, name);
            let address = format!("{}/{}", rig.name, name);
            let running = live.contains(&session);
            let mut agent = AgentRuntime::new(name, address, session, role, running);

            if let Some(bead) = beads.agents.get(&agent.address) {
                if let Some(hook) = bead.hook_bead() {
                    agent.has_work = true;
                    agent.work_title = beads.hooks.get(&hook).map(|h| h.title.clone());
                    agent.hook_bead = Some(hook);
                    active_hooks += 1;
                }
                agent.state = bead.agent_state();
            }

            if !fast {
                agent.unread_mail = self.unread_mail(&agent.address);
            }
            agents.push(agent);
        }

        if rig.has_witness {
            let session = tmux::witness_session(&rig.name);
            let running = live.contains(&session);
            agents.push(AgentRuntime::new(
                "witness",
                format!("{}/witness", rig.name),
                session,
                AgentRole::Witness,
                running,
            ));
        }
        if rig.has_refinery {
            let session = tmux::refinery_session(&rig.name);
            let running = live.contains(&session);
            agents.push(AgentRuntime::new(
                "refinery",
                format!("{}/refinery", rig.name),
                session,
                AgentRole::Refinery,
                running,
            ));
        }

        RigStatus {
            name: rig.name.clone(),
            path: rig.path.display().to_string(),
            polecats: rig.polecats.clone(),
            polecat_count: rig.polecats.len(),
            crews: rig.crew.clone(),
            crew_count: rig.crew.len(),
            has_witness: rig.has_witness,
            has_refinery: rig.has_refinery,
            active_hooks,
            agents,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mail::MailMessage;
    use crate::models::TYPE_AGENT;
    use crate::test_utils::TestTown;
    use crate::tmux::StaticSessions;

    fn agent_bead(id: &str, address: &str, description: &str) -> Issue {
        let mut bead = Issue::new(id, address);
        bead.issue_type = TYPE_AGENT.to_string();
        bead.assignee = Some(address.to_string());
        bead.description = description.to_string();
        bead
    }

    fn builder(town: &TestTown, sessions: &[&str]) -> StatusBuilder {
        StatusBuilder::new(
            town.path(),
            Arc::new(StaticSessions::new(sessions.iter().copied())),
            Arc::new(JsonlStoreProvider),
            Arc::new(JsonlMailRouter::new(town.path())),
        )
    }

    fn acme_town() -> TestTown {
        let town = TestTown::new();
        town.write_config("name \"gastown\"\nrig \"acme\"\nrig \"infra\"");
        let acme = town.add_rig("acme", &["fox", "badger"], &["max"], true, true);
        town.add_rig("infra", &["owl"], &[], true, false);

        let mut hook = Issue::new("ac-42", "Fix login bug");
        hook.status = crate::models::IssueStatus::Hooked;
        town.seed(
            &acme,
            &[
                hook,
                agent_bead(
                    "ac-agent-fox",
                    "acme/fox",
                    "hook_bead: ac-42\nagent_state: working",
                ),
                agent_bead("ac-agent-max", "acme/max", "agent_state: idle"),
            ],
        );
        town
    }

    #[test]
    fn test_build_rig_agents() {
        let town = acme_town();
        let status = builder(&town, &["gt-acme-fox", "gt-acme-witness"])
            .build(false)
            .unwrap();

        assert_eq!(status.name, "gastown");
        assert_eq!(status.rigs.len(), 2);
        let acme = status.find_rig("acme").unwrap();
        let roles: Vec<AgentRole> = acme.agents.iter().map(|a| a.role).collect();
        assert_eq!(
            roles,
            vec![
                AgentRole::Polecat,
                AgentRole::Polecat,
                AgentRole::Crew,
                AgentRole::Witness,
                AgentRole::Refinery
            ]
        );

        let fox = status.find_agent("acme/fox").unwrap();
        assert!(fox.running);
        assert!(fox.has_work);
        assert_eq!(fox.hook_bead.as_deref(), Some("ac-42"));
        assert_eq!(fox.work_title.as_deref(), Some("Fix login bug"));
        assert_eq!(fox.state.as_deref(), Some("working"));
        assert_eq!(fox.session, "gt-acme-fox");

        let max = status.find_agent("acme/max").unwrap();
        assert!(!max.running);
        assert!(!max.has_work);
        assert_eq!(max.state.as_deref(), Some("idle"));

        assert!(status.find_agent("acme/witness").unwrap().running);
        assert!(!status.find_agent("acme/refinery").unwrap().running);
    }

    #[test]
    fn test_summary_matches_rigs() {
        let town = acme_town();
        let status = builder(&town, &[]).build(true).unwrap();

        let summary = status.summary;
        assert_eq!(summary.rig_count, status.rigs.len());
        assert_eq!(
            summary.active_hooks,
            status.rigs.iter().map(|r| r.active_hooks).sum::<usize>()
        );
        assert_eq!(summary.polecat_count, 3);
        assert_eq!(summary.crew_count, 1);
        assert_eq!(summary.witness_count, 2);
        assert_eq!(summary.refinery_count, 1);
        assert_eq!(summary.active_hooks, 1);
    }

    #[test]
    fn test_global_agents_only_when_live() {
        let town = acme_town();
        let status = builder(&town, &["gt-mayor"]).build(true).unwrap();
        assert_eq!(status.agents.len(), 1);
        assert_eq!(status.agents[0].role, AgentRole::Mayor);
        assert_eq!(status.find_agent("mayor").unwrap().session, "gt-mayor");
        assert!(status.find_agent("deacon").is_none());
    }

    #[test]
    fn test_mail_counts_only_in_full_mode() {
        let town = acme_town();
        let mail = JsonlMailRouter::new(town.path());
        mail.send("acme/fox", &MailMessage::new("m-1", "mayor", "acme/fox", "hi"))
            .unwrap();

        let builder = builder(&town, &[]);
        let full = builder.build(false).unwrap();
        assert_eq!(full.find_agent("acme/fox").unwrap().unread_mail, 1);

        let fast = builder.build(true).unwrap();
        assert_eq!(fast.find_agent("acme/fox").unwrap().unread_mail, 0);
    }

    #[test]
    fn test_missing_rig_dir_fails_build() {
        let town = TestTown::new();
        town.write_config("rig \"ghost\"");
        let err = builder(&town, &[]).build(true).unwrap_err();
        assert!(matches!(err, crate::Error::Discovery(_)));
    }

    #[test]
    fn test_broken_config_is_soft() {
        let town = TestTown::new();
        town.write_config("rig \"unterminated");
        let status = builder(&town, &[]).build(true).unwrap();
        assert!(status.rigs.is_empty());
        assert_eq!(status.summary, StatusSummary::default());
    }

    #[test]
    fn test_rig_without_beads_still_builds() {
        let town = TestTown::new();
        town.write_config("rig \"bare\"");
        std::fs::create_dir_all(town.path().join("bare/polecats/fox")).unwrap();
        let status = builder(&town, &["gt-bare-fox"]).build(true).unwrap();
        let fox = status.find_agent("bare/fox").unwrap();
        assert!(fox.running);
        assert!(!fox.has_work);
    }

    #[test]
    fn test_hook_without_resolvable_bead_has_no_title() {
        let town = TestTown::new();
        town.write_config("rig \"acme\"");
        let acme = town.add_rig("acme", &["fox"], &[], false, false);
        town.seed(&acme, &[agent_bead("ac-agent-fox", "acme/fox", "hook_bead: gt-999")]);

        let status = builder(&town, &[]).build(true).unwrap();
        let fox = status.find_agent("acme/fox").unwrap();
        assert!(fox.has_work);
        assert_eq!(fox.hook_bead.as_deref(), Some("gt-999"));
        assert_eq!(fox.work_title, None);
    }
}
