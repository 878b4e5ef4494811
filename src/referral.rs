//! Referral handling: the throw-mode referral object and follow-mode chasing

use log::{debug, warn};

use crate::{
    client::{LdapClient, Result},
    error::Error,
    message::{Control, LdapResult},
    model::SearchResult,
    ops::{Operation, SearchRequest},
    options::LdapOptions,
    url::LdapUrl,
};

/// Referral returned to the caller in throw mode.
///
/// Walk the URL list with [`Referral::referral_info`] and [`Referral::skip_referral`], and
/// open a client to the current URL with [`Referral::referral_client`].
#[derive(Debug, Clone)]
pub struct Referral {
    urls: Vec<String>,
    index: usize,
    result: LdapResult,
    options: LdapOptions,
}

impl Referral {
    pub(crate) fn new(urls: Vec<String>, result: LdapResult, options: LdapOptions) -> Self {
        Self {
            urls,
            index: 0,
            result,
            options,
        }
    }

    /// Current referral URL, `None` once the list is exhausted
    pub fn referral_info(&self) -> Option<&str> {
        self.urls.get(self.index).map(String::as_str)
    }

    /// Advance to the next URL. Returns true if one remains.
    pub fn skip_referral(&mut self) -> bool {
        if self.index < self.urls.len() {
            self.index += 1;
        }
        self.index < self.urls.len()
    }

    pub fn urls(&self) -> &[String] {
        &self.urls
    }

    /// Result that carried the referral
    pub fn result(&self) -> &LdapResult {
        &self.result
    }

    /// Connect to the current URL. `overrides` are property-style settings that take
    /// precedence over the original environment; `controls` replace the connect-time controls.
    pub async fn referral_client<I, K, V>(&self, overrides: I, controls: Option<Vec<Control>>) -> Result<LdapClient>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut options = self.options.with_properties(overrides)?;
        if let Some(controls) = controls {
            options.connect_controls = controls;
        }
        self.referral_client_with_options(options).await
    }

    /// Connect to the current URL with a complete replacement environment
    pub async fn referral_client_with_options(&self, options: LdapOptions) -> Result<LdapClient> {
        let url = self
            .referral_info()
            .ok_or_else(|| Error::OperationFailed(self.result.clone().into()))?;
        let url = LdapUrl::parse(url)?;
        LdapClient::connect_to(&url, options).await
    }
}

fn check_hops(options: &LdapOptions, hops: usize) -> Result<()> {
    if hops >= options.referral_hop_limit {
        warn!("Referral hop limit {} reached", options.referral_hop_limit);
        Err(Error::ReferralLimitExceeded(options.referral_hop_limit))
    } else {
        Ok(())
    }
}

/// Connect to the first reachable URL of a referral. The walk is bounded by the list;
/// loops between servers are only stopped by the hop limit.
async fn connect_first(urls: &[String], options: &LdapOptions) -> Option<(LdapUrl, LdapClient)> {
    for url in urls {
        let url = match LdapUrl::parse(url) {
            Ok(url) => url,
            Err(e) => {
                warn!("Skipping referral {}: {}", url, e);
                continue;
            }
        };
        debug!("Following referral to {}", url);
        match LdapClient::connect_to(&url, options.clone()).await {
            Ok(client) => return Some((url, client)),
            Err(e) => warn!("Referral target {} failed: {}", url, e),
        }
    }
    None
}

/// Retry a single-response operation against the referral targets
pub(crate) async fn chase<O: Operation>(
    op: O,
    urls: Vec<String>,
    result: LdapResult,
    options: &LdapOptions,
    hops: usize,
) -> Result<O::Output> {
    check_hops(options, hops)?;

    match connect_first(&urls, options).await {
        Some((url, mut client)) => client.execute(op.rewrite_for_referral(&url), hops + 1).await,
        None => {
            debug!("Referral unresolved, tried {} URL(s)", urls.len());
            Err(Error::OperationFailed(result.into()))
        }
    }
}

/// Continue a search on the referral targets
pub(crate) async fn chase_search(
    request: SearchRequest,
    urls: Vec<String>,
    result: LdapResult,
    options: &LdapOptions,
    hops: usize,
) -> Result<SearchResult> {
    check_hops(options, hops)?;

    match connect_first(&urls, options).await {
        Some((url, mut client)) => client.search_with_hops(request.rewrite_for_referral(&url), hops + 1).await,
        None => {
            debug!("Search referral unresolved, tried {} URL(s)", urls.len());
            Err(Error::OperationFailed(result.into()))
        }
    }
}
