use std::time::Duration;

use crate::{
    error::Error,
    filter::{parse_filter_with_args, Filter},
    model::{Attribute, ChangeOperation, DerefAliases, SearchRequest, SearchScope},
    ops::{Change, ModifyRequest},
    options::LdapOptions,
};

pub struct SearchRequestBuilder {
    base_dn: String,
    scope: SearchScope,
    deref_aliases: DerefAliases,
    size_limit: u32,
    time_limit: Duration,
    types_only: bool,
    filter: String,
    filter_args: Vec<String>,
    attributes: Vec<String>,
}

impl Default for SearchRequestBuilder {
    fn default() -> Self {
        Self {
            base_dn: Default::default(),
            scope: SearchScope::BaseObject,
            deref_aliases: DerefAliases::Never,
            size_limit: 0,
            time_limit: Duration::default(),
            types_only: false,
            filter: "(objectClass=*)".to_owned(),
            filter_args: Vec::new(),
            attributes: Vec::new(),
        }
    }
}

impl SearchRequestBuilder {
    pub fn new() -> Self {
        SearchRequestBuilder::default()
    }

    /// Builder seeded with the deref-aliases and types-only settings of a configuration
    pub fn with_options(options: &LdapOptions) -> Self {
        Self {
            deref_aliases: options.deref_aliases,
            types_only: options.types_only,
            ..Self::default()
        }
    }

    pub fn base_dn<S: AsRef<str>>(mut self, base_dn: S) -> Self {
        self.base_dn = base_dn.as_ref().to_owned();
        self
    }

    pub fn scope(mut self, scope: SearchScope) -> Self {
        self.scope = scope;
        self
    }

    pub fn deref_aliases(mut self, deref_aliases: DerefAliases) -> Self {
        self.deref_aliases = deref_aliases;
        self
    }

    pub fn size_limit(mut self, size_limit: u32) -> Self {
        self.size_limit = size_limit;
        self
    }

    pub fn time_limit(mut self, time_limit: Duration) -> Self {
        self.time_limit = time_limit;
        self
    }

    pub fn types_only(mut self, types_only: bool) -> Self {
        self.types_only = types_only;
        self
    }

    pub fn filter<S: AsRef<str>>(mut self, filter: S) -> Self {
        self.filter = filter.as_ref().to_owned();
        self
    }

    /// Values substituted for `{0}`, `{1}`, ... placeholders in the filter
    pub fn filter_args<I, T>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: AsRef<str>,
    {
        self.filter_args = args.into_iter().map(|a| a.as_ref().to_owned()).collect();
        self
    }

    pub fn attributes<I, T>(mut self, attributes: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: AsRef<str>,
    {
        self.attributes = attributes.into_iter().map(|a| a.as_ref().to_owned()).collect();
        self
    }

    /// Parse the filter string and build the request
    pub fn build(self) -> Result<SearchRequest, Error> {
        let filter = if self.filter_args.is_empty() {
            crate::filter::parse_filter(&self.filter)?
        } else {
            parse_filter_with_args(&self.filter, &self.filter_args)?
        };
        Ok(self.build_with_filter(filter))
    }

    /// Build the request with a programmatically constructed filter
    pub fn build_with_filter(self, filter: Filter) -> SearchRequest {
        SearchRequest {
            base_object: self.base_dn,
            scope: self.scope,
            deref_aliases: self.deref_aliases,
            size_limit: self.size_limit,
            time_limit: self.time_limit.as_secs().min(u32::MAX as u64) as u32,
            types_only: self.types_only,
            filter,
            attributes: self.attributes,
        }
    }
}

/// Builder for a modify request; changes are applied by the server in the order given
pub struct ModifyRequestBuilder {
    dn: String,
    changes: Vec<Change>,
}

impl ModifyRequest {
    pub fn builder<S: AsRef<str>>(dn: S) -> ModifyRequestBuilder {
        ModifyRequestBuilder {
            dn: dn.as_ref().to_owned(),
            changes: Vec::new(),
        }
    }
}

impl ModifyRequestBuilder {
    pub fn change(mut self, operation: ChangeOperation, attribute: Attribute) -> Self {
        self.changes.push(Change {
            operation,
            modification: attribute.into(),
        });
        self
    }

    pub fn add(self, attribute: Attribute) -> Self {
        self.change(ChangeOperation::Add, attribute)
    }

    pub fn delete(self, attribute: Attribute) -> Self {
        self.change(ChangeOperation::Delete, attribute)
    }

    pub fn replace(self, attribute: Attribute) -> Self {
        self.change(ChangeOperation::Replace, attribute)
    }

    pub fn build(self) -> ModifyRequest {
        ModifyRequest {
            object: self.dn,
            changes: self.changes,
        }
    }
}
