use crate::config::{BlockConfig, DomainOverride};
use crate::core::Core;
use hickory_proto::rr::Name;
use std::str::FromStr;
use tracing::debug;

/// Outcome of evaluating one query against the policy model.
///
/// A `Block` carries any override targets the matching entry declared;
/// the handler answers NXDOMAIN regardless but callers can surface them.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Block {
        return_ip: Option<String>,
        return_cname: Option<String>,
    },
    Allow(Allowance),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Allowance {
    /// Set by an accepted permit override or a quarantine redirect; the
    /// rebinding check is suppressed when true.
    pub has_permit: bool,
    pub return_ip: Option<String>,
    pub return_cname: Option<String>,
    /// Categories of annotate-only lists the name appeared on.
    pub categories: Vec<String>,
}

impl Decision {
    pub fn is_blocked(&self) -> bool {
        matches!(self, Decision::Block { .. })
    }
}

/// Candidate names for the suffix walk: the full name first, then each
/// suffix obtained by stripping one leading label, down to the last label.
/// Uses DNS label boundaries, so escaped dots inside a label are safe.
fn suffix_chain(fqdn: &str) -> Vec<String> {
    let name = match Name::from_str(fqdn) {
        Ok(name) => name,
        Err(_) => return vec![fqdn.to_string()],
    };

    let mut chain = Vec::with_capacity(name.num_labels() as usize);
    let mut current = name;
    loop {
        chain.push(current.to_utf8());
        if current.num_labels() <= 1 {
            break;
        }
        current = current.base_name();
    }
    chain
}

/// Does this override apply to (client, candidate) right now, ignoring
/// the tag gate? `fqdn` is accepted as well as the candidate so an entry
/// for the full name matches at any depth of the walk.
fn override_applies(
    entry: &DomainOverride,
    now: i64,
    client_ip: &str,
    candidate: &str,
    fqdn: &str,
) -> bool {
    if entry.expiration != 0 && entry.expiration <= now {
        return false;
    }
    if !entry.client_ip.is_empty() && entry.client_ip != "*" && entry.client_ip != client_ip {
        return false;
    }
    entry.domain == candidate || entry.domain == fqdn
}

impl Core {
    /// Per-query policy decision. `fqdn` must be lowercase with a trailing
    /// dot; the handler normalizes before calling.
    pub fn blocked(&self, client_ip: &str, fqdn: &str) -> Decision {
        let config = self.config();
        let now = chrono::Utc::now().timestamp();

        // excluded clients skip every SPR-mode rule
        if self.spr_enabled()
            && config
                .client_ip_exclusions
                .iter()
                .any(|ip| ip == client_ip)
        {
            return Decision::Allow(Allowance::default());
        }

        if self.devices.ip_quarantined(client_ip) {
            if !config.quarantine_host_ip.is_empty() {
                return Decision::Allow(Allowance {
                    has_permit: true,
                    return_ip: Some(config.quarantine_host_ip.clone()),
                    return_cname: None,
                    categories: Vec::new(),
                });
            }
            return Decision::Block {
                return_ip: None,
                return_cname: None,
            };
        }

        self.walk_suffixes(&config, now, client_ip, fqdn)
    }

    fn walk_suffixes(
        &self,
        config: &BlockConfig,
        now: i64,
        client_ip: &str,
        fqdn: &str,
    ) -> Decision {
        let mut return_ip: Option<String> = None;
        let mut return_cname: Option<String> = None;
        let mut categories: Vec<String> = Vec::new();

        for candidate in suffix_chain(fqdn) {
            // permit overrides win over block overrides at the same suffix
            for entry in config.permit_domains() {
                if !override_applies(entry, now, client_ip, &candidate, fqdn) {
                    continue;
                }
                if !entry.result_ip.is_empty() {
                    return_ip = Some(entry.result_ip.clone());
                }
                if !entry.result_cname.is_empty() {
                    return_cname = Some(entry.result_cname.clone());
                }
                // NOTE: compatibility with the original config semantics --
                // the gate consults the tags of the entry's declared
                // ClientIP, not the requesting client.
                if !entry.tags.is_empty() && !self.devices.ip_has_tags(&entry.client_ip, &entry.tags)
                {
                    continue;
                }
                return Decision::Allow(Allowance {
                    has_permit: true,
                    return_ip,
                    return_cname,
                    categories,
                });
            }

            for entry in config.block_domains() {
                if !override_applies(entry, now, client_ip, &candidate, fqdn) {
                    continue;
                }
                if !entry.result_ip.is_empty() {
                    return_ip = Some(entry.result_ip.clone());
                }
                if !entry.result_cname.is_empty() {
                    return_cname = Some(entry.result_cname.clone());
                }
                if !entry.tags.is_empty() && !self.devices.ip_has_tags(&entry.client_ip, &entry.tags)
                {
                    continue;
                }
                return Decision::Block {
                    return_ip,
                    return_cname,
                };
            }

            let Some(record) = self.index_get(&candidate) else {
                continue;
            };
            if record.disabled {
                continue;
            }

            let lists: Vec<_> = record
                .list_ids
                .iter()
                .filter_map(|id| usize::try_from(*id).ok())
                .filter_map(|id| config.block_lists.get(id))
                .collect();

            for list in &lists {
                if !list.category.is_empty() && !categories.contains(&list.category) {
                    categories.push(list.category.clone());
                }
            }

            // annotate-only match: keep scanning outer suffixes
            let dont_block = !lists.is_empty() && lists.iter().all(|list| list.dont_block);
            if dont_block {
                debug!(candidate, "annotate-only blocklist match");
                continue;
            }

            // the first tagged list decides; untagged lists (or no config
            // list at all) leave the default block in place
            let mut block = true;
            for list in &lists {
                if !list.tags.is_empty() {
                    block = self.devices.ip_has_tags(client_ip, &list.tags);
                    break;
                }
            }

            if block {
                return Decision::Block {
                    return_ip,
                    return_cname,
                };
            }
            return Decision::Allow(Allowance {
                has_permit: false,
                return_ip,
                return_cname,
                categories,
            });
        }

        Decision::Allow(Allowance {
            has_permit: false,
            return_ip,
            return_cname,
            categories,
        })
    }
}
