use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use crate::models::{ActionEntity, PageEntity, ResourceId, ResourceKind, ResourceNode, ServiceEntity};

/// Assemble the service -> page/action forest from flat catalog lists.
///
/// Roots are ordered by service id with numeric-aware comparison. Within a
/// service, pages come before actions and each group keeps its input order.
/// Any page or action whose service does not exist makes the whole result
/// empty.
pub fn build_resource_tree(services: &[ServiceEntity], pages: &[PageEntity], actions: &[ActionEntity]) -> Vec<ResourceNode> {
    let known: HashSet<&str> = services.iter().map(|s| s.id.as_str()).collect();

    let dangling = pages
        .iter()
        .map(|p| (ResourceKind::Page, p.id.as_str(), p.service_id.as_str()))
        .chain(actions.iter().map(|a| (ResourceKind::Action, a.id.as_str(), a.service_id.as_str())))
        .find(|(_, _, parent)| !known.contains(parent));
    if let Some((kind, id, parent)) = dangling {
        tracing::warn!(?kind, id, parent, "catalog entry references a missing service; tree not built");
        return Vec::new();
    }

    let mut children: HashMap<&str, Vec<ResourceNode>> = HashMap::new();
    for page in pages {
        let parent = ResourceId::service(page.service_id.as_str());
        children.entry(page.service_id.as_str()).or_default().push(ResourceNode {
            id: ResourceId::page(page.id.as_str()),
            label: page.label.clone(),
            kind: ResourceKind::Page,
            parent_id: Some(parent),
            children: Vec::new(),
        });
    }
    for action in actions {
        let parent = ResourceId::service(action.service_id.as_str());
        children.entry(action.service_id.as_str()).or_default().push(ResourceNode {
            id: ResourceId::action(action.id.as_str()),
            label: action.label.clone(),
            kind: ResourceKind::Action,
            parent_id: Some(parent),
            children: Vec::new(),
        });
    }

    let mut ordered: Vec<&ServiceEntity> = services.iter().collect();
    ordered.sort_by(|a, b| natural_cmp(&a.id, &b.id));

    ordered
        .into_iter()
        .map(|service| ResourceNode {
            id: ResourceId::service(service.id.as_str()),
            label: service.label.clone(),
            kind: ResourceKind::Service,
            parent_id: None,
            children: children.remove(service.id.as_str()).unwrap_or_default(),
        })
        .collect()
}

/// Compares digit runs by numeric value and everything else by character.
pub fn natural_cmp(a: &str, b: &str) -> Ordering {
    let mut left = Chunks(a);
    let mut right = Chunks(b);
    loop {
        match (left.next(), right.next()) {
            (None, None) => return a.cmp(b),
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) => {
                let order = match (is_digits(x), is_digits(y)) {
                    (true, true) => {
                        let (x, y) = (x.trim_start_matches('0'), y.trim_start_matches('0'));
                        x.len().cmp(&y.len()).then_with(|| x.cmp(y))
                    }
                    _ => x.cmp(y),
                };
                if order != Ordering::Equal {
                    return order;
                }
            }
        }
    }
}

fn is_digits(chunk: &str) -> bool {
    chunk.bytes().all(|b| b.is_ascii_digit())
}

/// Splits a string into alternating digit / non-digit runs.
struct Chunks<'a>(&'a str);

impl<'a> Iterator for Chunks<'a> {
    type Item = &'a str;

    fn next(&mut self) -> Option<&'a str> {
        let first = self.0.chars().next()?;
        let digit = first.is_ascii_digit();
        let end = self
            .0
            .char_indices()
            .find(|(_, c)| c.is_ascii_digit() != digit)
            .map(|(i, _)| i)
            .unwrap_or(self.0.len());
        let (chunk, rest) = self.0.split_at(end);
        self.0 = rest;
        Some(chunk)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Label;

    fn service(id: &str) -> ServiceEntity {
        ServiceEntity { id: id.into(), label: Label::new(format!("Service {id}"), "") }
    }

    fn page(id: &str, service_id: &str) -> PageEntity {
        PageEntity { id: id.into(), service_id: service_id.into(), label: Label::new(format!("Page {id}"), "") }
    }

    fn action(id: &str, service_id: &str) -> ActionEntity {
        ActionEntity { id: id.into(), service_id: service_id.into(), label: Label::new(format!("Action {id}"), "") }
    }

    #[test]
    fn natural_order_puts_ten_after_nine() {
        let mut ids = vec!["10", "9", "1", "a2", "a10", "02"];
        ids.sort_by(|a, b| natural_cmp(a, b));
        assert_eq!(ids, vec!["1", "02", "9", "10", "a2", "a10"]);
    }

    #[test]
    fn services_sorted_and_children_grouped() {
        let services = vec![service("10"), service("9")];
        let pages = vec![page("p2", "9"), page("p1", "9")];
        let actions = vec![action("a1", "9"), action("a2", "10")];

        let tree = build_resource_tree(&services, &pages, &actions);
        assert_eq!(tree.len(), 2);
        assert_eq!(tree[0].id.to_string(), "s:9");
        assert_eq!(tree[1].id.to_string(), "s:10");

        let kids: Vec<String> = tree[0].children.iter().map(|c| c.id.to_string()).collect();
        assert_eq!(kids, vec!["ss:p2", "ss:p1", "sss:a1"]);
        assert_eq!(tree[0].children[0].parent_id, Some(ResourceId::service("9")));
    }

    #[test]
    fn dangling_parent_yields_empty_forest() {
        let tree = build_resource_tree(&[service("1")], &[page("p", "404")], &[]);
        assert!(tree.is_empty());
    }

    #[test]
    fn service_without_children_is_a_leaf_root() {
        let tree = build_resource_tree(&[service("1")], &[], &[]);
        assert_eq!(tree.len(), 1);
        assert!(tree[0].children.is_empty());
        assert_eq!(tree[0].kind, ResourceKind::Service);
    }
}
