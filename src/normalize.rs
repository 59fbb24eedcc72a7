use regex::Regex;

use crate::common::Result;

/// Canonical hostname form shared by every provider: lowercase, with any of
/// the configured DNS domain suffixes stripped. Built once per run from
/// `domain_names` and applied during itemize so keys match across sources
/// that disagree about fully-qualified names.
#[derive(Clone, Debug)]
pub struct HostnameNormalizer {
    strip: Option<Regex>,
}

impl HostnameNormalizer {
    pub fn new(domain_names: &[String]) -> Result<Self> {
        if domain_names.is_empty() {
            return Ok(Self { strip: None });
        }
        let pattern = domain_names
            .iter()
            .map(|domain| regex::escape(&format!(".{}", domain.to_lowercase())))
            .collect::<Vec<_>>()
            .join("|");
        let strip = Regex::new(&pattern)
            .map_err(|err| crate::common::AuditError::api(format!("bad domain list: {err}")))?;
        Ok(Self { strip: Some(strip) })
    }

    pub fn normalize(&self, hostname: &str) -> String {
        let lowered = hostname.to_lowercase();
        match &self.strip {
            Some(re) => re.replace_all(&lowered, "").into_owned(),
            None => lowered,
        }
    }
}
