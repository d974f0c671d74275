//! Check bundle resolution
//!
//! Find-or-create semantics for the logical check resource, default-value
//! backfilling, tag reconciliation, and the refresh path the submission
//! pipeline triggers on a stale-endpoint (404) classification.

use rand::RngCore;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::api::{
    CheckBundle, CONFIG_ASYNC_METRICS, CONFIG_SECRET, CONFIG_SUBMISSION_URL, STATUS_ACTIVE,
};
use crate::error::{TrapError, TrapResult};
use crate::session::TrapSession;

impl TrapSession {
    /// Resolve the check: fetch by CID when configured, otherwise apply
    /// defaults and find-or-create by search tags
    pub(crate) async fn initialize_check(&mut self) -> TrapResult<()> {
        let cfg = self.check_config.clone().unwrap_or_default();

        if !cfg.cid.is_empty() {
            return self.fetch_check_bundle(&cfg.cid).await;
        }

        let mut cfg = cfg;
        self.apply_check_bundle_defaults(&mut cfg);

        if self.find_check_bundle(&cfg).await? {
            return Ok(());
        }
        self.create_check_bundle(cfg).await
    }

    /// Re-fetch the check bundle and reset broker/TLS trust, after a
    /// stale-endpoint submission failure. Returns false (no refresh
    /// possible) when a custom submission URL pins the endpoint.
    pub(crate) async fn refresh_check(&mut self) -> TrapResult<bool> {
        if self.custom_submission_url.is_some() {
            return Ok(false);
        }

        let cid = self
            .check_bundle
            .as_ref()
            .map(|b| b.cid.clone())
            .ok_or_else(|| TrapError::InvalidState("check bundle not initialized".to_string()))?;

        let bundle = self
            .client
            .fetch_check_bundle(&cid)
            .await
            .map_err(|e| TrapError::Api(format!("fetching check bundle: {}", e)))?;

        let surl = bundle.submission_url().cloned().ok_or_else(|| {
            TrapError::InvalidState("no submission url found in check bundle config".to_string())
        })?;

        debug!(cid = %bundle.cid, "refreshed check bundle");
        self.check_bundle = Some(bundle);
        self.submission_url = surl;

        // the check may have moved to a different broker
        self.clear_tls();
        self.ensure_tls().await?;
        Ok(true)
    }

    async fn fetch_check_bundle(&mut self, cid: &str) -> TrapResult<()> {
        let bundle = self
            .client
            .fetch_check_bundle(cid)
            .await
            .map_err(|e| TrapError::Api(format!("retrieving check bundle ({}): {}", cid, e)))?;

        if bundle.status != STATUS_ACTIVE {
            return Err(TrapError::InvalidState(format!(
                "invalid check bundle ({}), not active",
                bundle.cid
            )));
        }
        if bundle.submission_url().is_none() {
            return Err(TrapError::InvalidState(format!(
                "invalid check bundle ({}) no '{}' in config",
                bundle.cid, CONFIG_SUBMISSION_URL
            )));
        }

        self.check_bundle = Some(bundle);
        Ok(())
    }

    /// Search for an existing bundle matching type/target/tags. A broad
    /// search returning several candidates is disambiguated by exact type;
    /// duplicates of the exact type are an error rather than a guessed
    /// tiebreak.
    async fn find_check_bundle(&mut self, cfg: &CheckBundle) -> TrapResult<bool> {
        let criteria = format!(
            "(active:1)(type:\"{}\")(target:\"{}\")(tags:{})",
            cfg.check_type,
            cfg.target,
            self.check_search_tags.join(",")
        );

        let bundles = self
            .client
            .search_check_bundles(&criteria)
            .await
            .map_err(|e| TrapError::Api(format!("search check bundles ({}): {}", criteria, e)))?;

        match bundles.len() {
            0 => Ok(false),
            1 => {
                self.check_bundle = bundles.into_iter().next();
                Ok(true)
            }
            n => {
                let mut exact: Vec<CheckBundle> = bundles
                    .into_iter()
                    .filter(|b| b.check_type == cfg.check_type)
                    .collect();
                match exact.len() {
                    0 => Err(TrapError::InvalidState(format!(
                        "multiple ({}) bundles found matching '{}' none are type ({})",
                        n, criteria, cfg.check_type
                    ))),
                    1 => {
                        self.check_bundle = Some(exact.swap_remove(0));
                        Ok(true)
                    }
                    dups => Err(TrapError::InvalidState(format!(
                        "multiple ({}) check bundles found matching '{}'",
                        dups, criteria
                    ))),
                }
            }
        }
    }

    async fn create_check_bundle(&mut self, mut cfg: CheckBundle) -> TrapResult<()> {
        // select a broker only now: an existing check already has one
        if cfg.brokers.is_empty() {
            let broker = self.selector.select(None, &cfg.check_type).await?;
            cfg.brokers = vec![broker.cid.clone()];
            self.broker = Some(broker);
        }
        let bundle = self
            .client
            .create_check_bundle(&cfg)
            .await
            .map_err(|e| TrapError::Api(format!("create check bundle: {}", e)))?;
        self.check_bundle = Some(bundle);
        self.new_check_bundle = true;
        Ok(())
    }

    /// Backfill every field the API requires with a sensible default
    fn apply_check_bundle_defaults(&mut self, cfg: &mut CheckBundle) {
        let prog_name = std::env::current_exe()
            .ok()
            .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
            .unwrap_or_else(|| "trapflow".to_string());
        let host_name = hostname_or_unknown();

        if cfg.check_type.is_empty() {
            cfg.check_type = "httptrap".to_string();
        }
        if cfg.status.is_empty() {
            cfg.status = STATUS_ACTIVE.to_string();
        }

        // must be present as an empty array
        cfg.metrics = Vec::new();

        if cfg.metric_filters.is_empty() {
            cfg.metric_filters = vec![vec![
                "allow".to_string(),
                ".".to_string(),
                String::new(),
            ]];
        }

        if self.check_search_tags.is_empty() {
            self.check_search_tags = vec![format!("service:{}", prog_name)];
        }
        if cfg.tags.is_empty() {
            cfg.tags = self.check_search_tags.clone();
        } else {
            cfg.tags.extend(self.check_search_tags.iter().cloned());
        }

        let instance_id = format!("{}:{}", host_name, prog_name);
        if cfg.display_name.is_empty() {
            cfg.display_name = instance_id.clone();
        }
        if cfg.target.is_empty() {
            cfg.target = instance_id.clone();
        }
        if cfg.notes.is_none() {
            cfg.notes = Some(format!("tcid:{}", instance_id));
        }

        if cfg.period == 0 {
            cfg.period = 60;
        }
        if cfg.timeout == 0.0 {
            cfg.timeout = 10.0;
        }

        let async_set = cfg
            .config
            .get(CONFIG_ASYNC_METRICS)
            .is_some_and(|v| !v.is_empty());
        if !async_set {
            cfg.config
                .insert(CONFIG_ASYNC_METRICS.to_string(), "true".to_string());
        }

        let secret_set = cfg.config.get(CONFIG_SECRET).is_some_and(|v| !v.is_empty());
        if !secret_set {
            cfg.config.insert(CONFIG_SECRET.to_string(), make_secret());
        }
    }

    /// Reconcile `category:value` tags on the current bundle: replace a tag
    /// whose category matches but value differs, append missing tags, and
    /// push the update only when something changed. Returns the updated
    /// bundle, or `None` when no update was needed.
    pub async fn update_check_tags(&mut self, tags: &[String]) -> TrapResult<Option<CheckBundle>> {
        let bundle = self
            .check_bundle
            .as_mut()
            .ok_or_else(|| TrapError::InvalidState("check bundle not initialized".to_string()))?;
        if tags.is_empty() {
            return Ok(None);
        }

        let mut update = false;
        for tag in tags {
            if tag.is_empty() {
                continue;
            }
            let mut found = false;
            let tag_category = tag.split_once(':').map(|(c, _)| c);
            for existing in bundle.tags.iter_mut() {
                if existing == tag {
                    found = true;
                    break;
                }
                let existing_category = existing.split_once(':').map(|(c, _)| c);
                if let (Some(cat), Some(ecat)) = (tag_category, existing_category) {
                    if cat == ecat {
                        warn!(new = %tag, old = %existing, "modifying tag");
                        *existing = tag.clone();
                        update = true;
                        found = true;
                        break;
                    }
                }
            }
            if !found {
                warn!(tag = %tag, current = ?bundle.tags, "adding missing tag");
                bundle.tags.push(tag.clone());
                update = true;
            }
        }

        if !update {
            return Ok(None);
        }

        let updated = self
            .client
            .update_check_bundle(bundle)
            .await
            .map_err(|e| TrapError::Api(format!("api updating check bundle tags: {}", e)))?;
        self.check_bundle = Some(updated.clone());
        Ok(Some(updated))
    }
}

fn hostname_or_unknown() -> String {
    let host = gethostname::gethostname().to_string_lossy().into_owned();
    if host.is_empty() {
        "unknown".to_string()
    } else {
        host
    }
}

/// Dynamic 16-hex-char secret for a new check's submission URL
fn make_secret() -> String {
    let mut seed = [0u8; 2048];
    rand::rngs::OsRng.fill_bytes(&mut seed);
    let digest = Sha256::digest(seed);
    hex::encode(digest)[..16].to_string()
}
