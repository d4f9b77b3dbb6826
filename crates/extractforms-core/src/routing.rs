//! Assigning schema fields to the physical pages they should be read from.

use std::collections::BTreeMap;

use crate::models::SchemaSpec;
use crate::pages::PageSelectionAnalysis;

/// Logical schema page -> physical PDF page.
pub type PageMap = BTreeMap<u32, u32>;

/// Keys grouped by physical page, plus the keys no page could be found for.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageRouting {
    pub keys_by_page: BTreeMap<u32, Vec<String>>,
    pub unresolved_keys: Vec<String>,
}

impl PageRouting {
    pub fn has_page_keys(&self) -> bool {
        self.keys_by_page.values().any(|keys| !keys.is_empty())
    }

    /// Every routed key, in page order.
    pub fn routed_keys(&self) -> impl Iterator<Item = &str> {
        self.keys_by_page.values().flatten().map(String::as_str)
    }
}

/// Map the schema's logical pages onto the physical pages that survived blank filtering.
///
/// Falls back to identity when no analysis is available, nothing was dropped, or the
/// schema references more pages than were kept.
pub fn build_schema_page_mapping(
    schema: &SchemaSpec,
    analysis: Option<&PageSelectionAnalysis>,
) -> PageMap {
    let Some(max_page) = schema.max_field_page() else {
        return PageMap::new();
    };
    let identity = || (1..=max_page).map(|p| (p, p)).collect::<PageMap>();

    let Some(analysis) = analysis else {
        return identity();
    };
    if analysis.selected_page_numbers.is_empty() {
        return identity();
    }

    let nonblank = &analysis.nonblank_page_numbers;
    let dropped_pages = nonblank.len() < analysis.selected_page_numbers.len();
    if !nonblank.is_empty() && dropped_pages && max_page as usize <= nonblank.len() {
        return (1..=max_page)
            .map(|p| (p, nonblank[(p - 1) as usize]))
            .collect();
    }
    identity()
}

/// Route every schema field to a physical page.
///
/// Fields carrying a page go to that page, remapped through `page_map`. Fields
/// without one inherit the page of the positionally nearest anchored field; an
/// exact tie goes to the earlier anchor. When no field has a page, every key is
/// left unresolved.
pub fn route_schema_fields(schema: &SchemaSpec, page_map: Option<&PageMap>) -> PageRouting {
    let map_page = |page: u32| page_map.and_then(|m| m.get(&page).copied()).unwrap_or(page);

    let mut routing = PageRouting::default();
    let mut anchors: Vec<(usize, u32)> = Vec::new();

    for (index, field) in schema.fields.iter().enumerate() {
        if let Some(page) = field.page {
            let physical = map_page(page);
            anchors.push((index, physical));
            push_unique(routing.keys_by_page.entry(physical).or_default(), &field.key);
        }
    }

    for (index, field) in schema.fields.iter().enumerate() {
        if field.page.is_some() {
            continue;
        }
        let nearest = anchors
            .iter()
            .min_by_key(|(anchor_index, _)| anchor_index.abs_diff(index));
        match nearest {
            Some(&(_, page)) => {
                tracing::debug!(key = %field.key, page, "inferred page for sparse key");
                push_unique(routing.keys_by_page.entry(page).or_default(), &field.key);
            }
            None => routing.unresolved_keys.push(field.key.clone()),
        }
    }

    routing
}

fn push_unique(keys: &mut Vec<String>, key: &str) {
    if !keys.iter().any(|k| k == key) {
        keys.push(key.to_string());
    }
}
