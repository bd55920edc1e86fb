//! Search request parsing
//!
//! The engine treats the parsed query as a mostly opaque [`SearchContext`]:
//! persistence interprets the filters, the assembler reads the paging and
//! subsetting fields.

use crate::models::{Issue, IssueType};
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SummaryMode {
    True,
    False,
    Count,
    Text,
    Data,
}

impl SummaryMode {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "true" => Some(SummaryMode::True),
            "false" => Some(SummaryMode::False),
            "count" => Some(SummaryMode::Count),
            "text" => Some(SummaryMode::Text),
            "data" => Some(SummaryMode::Data),
            _ => None,
        }
    }
}

/// One search filter, e.g. `identifier:exact=a|b,c` (values are OR-ed).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchFilter {
    pub name: String,
    pub modifier: Option<String>,
    pub values: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortSpec {
    pub parameter: String,
    pub ascending: bool,
}

/// `_include` / `_revinclude` target: `SourceType:searchParam`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncludeSpec {
    pub source_type: String,
    pub parameter: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchContext {
    /// `None` searches every resource type.
    pub resource_type: Option<String>,
    pub compartment: Option<(String, String)>,
    pub filters: Vec<SearchFilter>,
    pub sort: Vec<SortSpec>,
    pub includes: Vec<IncludeSpec>,
    pub revincludes: Vec<IncludeSpec>,
    pub summary: Option<SummaryMode>,
    pub elements: Vec<String>,
    /// 1-based.
    pub page_number: usize,
    pub page_size: usize,
    /// Filled after the search ran.
    pub total_count: usize,
    pub match_count: usize,
    pub last_page_number: usize,
    /// Lenient-mode warnings about ignored parameters.
    pub warnings: Vec<Issue>,
}

impl SearchContext {
    pub fn new(resource_type: Option<&str>, page_size: usize) -> Self {
        Self {
            resource_type: resource_type.map(str::to_string),
            compartment: None,
            filters: Vec::new(),
            sort: Vec::new(),
            includes: Vec::new(),
            revincludes: Vec::new(),
            summary: None,
            elements: Vec::new(),
            page_number: 1,
            page_size,
            total_count: 0,
            match_count: 0,
            last_page_number: 1,
            warnings: Vec::new(),
        }
    }

    pub fn filter(mut self, name: &str, value: &str) -> Self {
        self.filters.push(SearchFilter {
            name: name.to_string(),
            modifier: None,
            values: vec![value.to_string()],
        });
        self
    }

    /// Index of the first match of the current page.
    pub fn offset(&self) -> usize {
        self.page_number.saturating_sub(1) * self.page_size
    }

    pub fn is_count_only(&self) -> bool {
        self.summary == Some(SummaryMode::Count) || self.page_size == 0
    }

    /// Result is a subset of the stored resource.
    pub fn is_subsetted(&self) -> bool {
        !self.elements.is_empty()
            || matches!(
                self.summary,
                Some(SummaryMode::True | SummaryMode::Text | SummaryMode::Data)
            )
    }

    /// Record the totals reported by persistence.
    pub fn set_totals(&mut self, total_count: usize, match_count: usize) {
        self.total_count = total_count;
        self.match_count = match_count;
        self.last_page_number = if self.page_size == 0 {
            1
        } else {
            total_count.div_ceil(self.page_size).max(1)
        };
    }
}

/// Parses query parameters into a [`SearchContext`].
pub trait SearchParser: Send + Sync {
    fn parse(
        &self,
        resource_type: Option<&str>,
        compartment: Option<(&str, &str)>,
        query: &[(String, String)],
        lenient: bool,
    ) -> Result<SearchContext>;
}

/// Parser for the common control parameters plus simple filters.
#[derive(Debug, Clone)]
pub struct DefaultSearchParser {
    default_count: usize,
    max_count: usize,
}

impl DefaultSearchParser {
    pub fn new(default_count: usize, max_count: usize) -> Self {
        Self {
            default_count,
            max_count,
        }
    }

    fn reject(&self, lenient: bool, ctx: &mut SearchContext, message: String) -> Result<()> {
        if lenient {
            tracing::debug!(message = %message, "Ignoring search parameter");
            ctx.warnings
                .push(Issue::warning(IssueType::NotSupported, message));
            Ok(())
        } else {
            Err(crate::Error::InvalidRequest(message))
        }
    }
}

impl SearchParser for DefaultSearchParser {
    fn parse(
        &self,
        resource_type: Option<&str>,
        compartment: Option<(&str, &str)>,
        query: &[(String, String)],
        lenient: bool,
    ) -> Result<SearchContext> {
        let mut ctx = SearchContext::new(resource_type, self.default_count);
        ctx.compartment = compartment.map(|(c, id)| (c.to_string(), id.to_string()));

        for (name, value) in query {
            match name.as_str() {
                "_count" => match value.parse::<usize>() {
                    Ok(count) if count > self.max_count => {
                        ctx.warnings.push(Issue::warning(
                            IssueType::TooCostly,
                            format!(
                                "_count {} exceeds the maximum of {}; using {}",
                                count, self.max_count, self.max_count
                            ),
                        ));
                        ctx.page_size = self.max_count;
                    }
                    Ok(count) => ctx.page_size = count,
                    Err(_) => {
                        self.reject(lenient, &mut ctx, format!("Invalid _count value '{}'", value))?
                    }
                },
                "_page" => match value.parse::<usize>() {
                    Ok(page) if page > 0 => ctx.page_number = page,
                    _ => self.reject(lenient, &mut ctx, format!("Invalid _page value '{}'", value))?,
                },
                "_summary" => match SummaryMode::parse(value) {
                    Some(mode) => ctx.summary = Some(mode),
                    None => {
                        self.reject(lenient, &mut ctx, format!("Invalid _summary value '{}'", value))?
                    }
                },
                "_elements" => ctx.elements.extend(
                    value
                        .split(',')
                        .map(str::trim)
                        .filter(|e| !e.is_empty())
                        .map(str::to_string),
                ),
                "_include" | "_revinclude" => match parse_include(value) {
                    Some(spec) if name == "_include" => ctx.includes.push(spec),
                    Some(spec) => ctx.revincludes.push(spec),
                    None => self.reject(
                        lenient,
                        &mut ctx,
                        format!("Invalid {} value '{}'", name, value),
                    )?,
                },
                "_sort" => {
                    for key in value.split(',').filter(|k| !k.is_empty()) {
                        let (parameter, ascending) = match key.strip_prefix('-') {
                            Some(p) => (p, false),
                            None => (key, true),
                        };
                        ctx.sort.push(SortSpec {
                            parameter: parameter.to_string(),
                            ascending,
                        });
                    }
                }
                // Formatting parameters with no effect on the result set.
                "_format" | "_pretty" | "_total" => {}
                other if other.starts_with('_') && !matches!(other, "_id" | "_lastUpdated") => {
                    self.reject(
                        lenient,
                        &mut ctx,
                        format!("Search parameter '{}' is not supported", other),
                    )?;
                }
                other => {
                    let (param, modifier) = match other.split_once(':') {
                        Some((p, m)) => (p, Some(m.to_string())),
                        None => (other, None),
                    };
                    ctx.filters.push(SearchFilter {
                        name: param.to_string(),
                        modifier,
                        values: value.split(',').map(str::to_string).collect(),
                    });
                }
            }
        }

        Ok(ctx)
    }
}

fn parse_include(value: &str) -> Option<IncludeSpec> {
    let mut parts = value.split(':');
    let source_type = parts.next()?.to_string();
    let parameter = parts.next()?.to_string();
    if source_type.is_empty() || parameter.is_empty() {
        return None;
    }
    Some(IncludeSpec {
        source_type,
        parameter,
    })
}
