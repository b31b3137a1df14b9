use crate::constants::search_params;
use crate::models::{Profile, ProfileKind, Reference};

/// One filter clause of a FHIR search
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchFilter {
    /// `<param>=<reference>`
    ReferenceEquals { param: String, reference: String },
    /// `<param>:missing=<true|false>`
    Missing { param: String, missing: bool },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortSpec {
    pub param: String,
    pub descending: bool,
}

/// Typed FHIR search request. Rendered to query pairs for REST calls and to
/// a criteria string for subscriptions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchParams {
    pub filters: Vec<SearchFilter>,
    pub sort: Option<SortSpec>,
    pub count: Option<u32>,
    pub revinclude: Vec<String>,
}

impl SearchParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reference(mut self, param: &str, reference: &str) -> Self {
        self.filters.push(SearchFilter::ReferenceEquals {
            param: param.to_string(),
            reference: reference.to_string(),
        });
        self
    }

    pub fn missing(mut self, param: &str, missing: bool) -> Self {
        self.filters.push(SearchFilter::Missing {
            param: param.to_string(),
            missing,
        });
        self
    }

    pub fn sort_desc(mut self, param: &str) -> Self {
        self.sort = Some(SortSpec {
            param: param.to_string(),
            descending: true,
        });
        self
    }

    pub fn count(mut self, count: u32) -> Self {
        self.count = Some(count);
        self
    }

    pub fn revinclude(mut self, target: &str) -> Self {
        self.revinclude.push(target.to_string());
        self
    }

    fn filter_pairs(&self) -> Vec<(String, String)> {
        self.filters
            .iter()
            .map(|filter| match filter {
                SearchFilter::ReferenceEquals { param, reference } => {
                    (param.clone(), reference.clone())
                }
                SearchFilter::Missing { param, missing } => {
                    (format!("{}:missing", param), missing.to_string())
                }
            })
            .collect()
    }

    /// Query pairs for a REST search, directives included
    pub fn to_query_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = self.filter_pairs();
        for target in &self.revinclude {
            pairs.push(("_revinclude".to_string(), target.clone()));
        }
        if let Some(sort) = &self.sort {
            let value = if sort.descending {
                format!("-{}", sort.param)
            } else {
                sort.param.clone()
            };
            pairs.push(("_sort".to_string(), value));
        }
        if let Some(count) = self.count {
            pairs.push(("_count".to_string(), count.to_string()));
        }
        pairs
    }

    /// Subscription criteria: `<resource_type>?<filters>`, without
    /// pagination, sort or include directives.
    pub fn to_criteria(&self, resource_type: &str) -> String {
        let filters = self
            .filter_pairs()
            .into_iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("&");
        if filters.is_empty() {
            resource_type.to_string()
        } else {
            format!("{}?{}", resource_type, filters)
        }
    }
}

/// Thread roots visible to `profile`: Patients see their own threads,
/// everyone else sees all threads.
pub fn thread_filter(profile: &Profile) -> SearchParams {
    let params = SearchParams::new().missing(search_params::PART_OF, true);
    match profile.kind() {
        ProfileKind::Patient => params.reference(search_params::SUBJECT, profile.reference.as_str()),
        _ => params,
    }
}

/// Thread roots plus their messages in one round trip
pub fn thread_query(profile: &Profile, page_size: u32) -> SearchParams {
    thread_filter(profile)
        .revinclude(search_params::REVINCLUDE_PART_OF)
        .sort_desc(search_params::SENT)
        .count(page_size)
}

/// All messages of one thread, newest first
pub fn thread_messages_query(thread: &Reference) -> SearchParams {
    SearchParams::new()
        .reference(search_params::PART_OF, thread.as_str())
        .sort_desc(search_params::SENT)
}
