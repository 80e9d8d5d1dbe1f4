//! Minimal robots.txt evaluation for the politeness gate.

use std::collections::HashMap;

#[derive(Debug, Clone, Default)]
struct AgentRules {
    disallow: Vec<String>,
    allow: Vec<String>,
}

/// Parsed robots.txt rules, grouped per user-agent with a `*` default.
///
/// Allow rules take precedence over disallow; an empty body allows all.
#[derive(Debug, Clone, Default)]
pub struct RobotsTxt {
    rules: HashMap<String, AgentRules>,
    default_rules: AgentRules,
}

impl RobotsTxt {
    /// Parses a robots.txt body.
    pub fn parse(content: &str) -> Self {
        let mut robots = Self::default();
        let mut current_agents: Vec<String> = Vec::new();
        let mut current_rules = AgentRules::default();

        for line in content.lines() {
            let line = line.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }

            let Some((directive, value)) = line.split_once(':') else {
                continue;
            };
            let directive = directive.trim().to_lowercase();
            let value = value.trim();

            match directive.as_str() {
                "user-agent" => {
                    // A directive after a rule block starts a new group.
                    if !current_agents.is_empty()
                        && (!current_rules.disallow.is_empty() || !current_rules.allow.is_empty())
                    {
                        robots.store(&current_agents, current_rules.clone());
                        current_rules = AgentRules::default();
                        current_agents.clear();
                    }
                    current_agents.push(value.to_lowercase());
                }
                "disallow" => {
                    if !value.is_empty() {
                        current_rules.disallow.push(value.to_string());
                    }
                }
                "allow" => {
                    if !value.is_empty() {
                        current_rules.allow.push(value.to_string());
                    }
                }
                _ => {}
            }
        }

        robots.store(&current_agents, current_rules);
        robots
    }

    fn store(&mut self, agents: &[String], rules: AgentRules) {
        for agent in agents {
            if agent == "*" {
                self.default_rules = rules.clone();
            } else {
                self.rules.insert(agent.clone(), rules.clone());
            }
        }
    }

    /// Whether `path` may be fetched by `user_agent`.
    pub fn is_allowed(&self, user_agent: &str, path: &str) -> bool {
        let agent_lower = user_agent.to_lowercase();
        let rules = self
            .rules
            .get(&agent_lower)
            .or_else(|| {
                self.rules
                    .iter()
                    .find(|(name, _)| agent_lower.contains(name.as_str()))
                    .map(|(_, rules)| rules)
            })
            .unwrap_or(&self.default_rules);

        for allow in &rules.allow {
            if path.starts_with(allow.as_str()) {
                return true;
            }
        }
        for disallow in &rules.disallow {
            if disallow == "/" || path.starts_with(disallow.as_str()) {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_rules() {
        let robots = RobotsTxt::parse(
            "User-agent: *\nDisallow: /private/\nDisallow: /admin/\nAllow: /public/\n",
        );
        assert!(robots.is_allowed("TestBot", "/public/page"));
        assert!(!robots.is_allowed("TestBot", "/private/page"));
        assert!(!robots.is_allowed("TestBot", "/admin/"));
        assert!(robots.is_allowed("TestBot", "/other/page"));
    }

    #[test]
    fn specific_agent_overrides_default() {
        let robots = RobotsTxt::parse(
            "User-agent: *\nDisallow: /\n\nUser-agent: goodbot\nAllow: /\n",
        );
        assert!(!robots.is_allowed("BadBot", "/page"));
        assert!(robots.is_allowed("GoodBot", "/page"));
    }

    #[test]
    fn allow_overrides_disallow() {
        let robots = RobotsTxt::parse("User-agent: *\nDisallow: /private/\nAllow: /private/public/\n");
        assert!(!robots.is_allowed("Bot", "/private/secret"));
        assert!(robots.is_allowed("Bot", "/private/public/page"));
    }

    #[test]
    fn empty_body_allows_everything() {
        let robots = RobotsTxt::parse("");
        assert!(robots.is_allowed("AnyBot", "/any/path"));
    }

    #[test]
    fn blocked_path_from_gate_scenario() {
        let robots = RobotsTxt::parse("User-agent: *\nDisallow: /blocked\n");
        assert!(!robots.is_allowed("RarefactorBot/2.0", "/blocked"));
        assert!(robots.is_allowed("RarefactorBot/2.0", "/open"));
    }
}
