use std::collections::HashSet;

use crate::server::ServerConfig;

/// Picks the next server to try after a failed attempt. Implementations must
/// never return a server whose id is in `tried`.
pub trait FailoverPolicy: Send + Sync {
    fn next<'a>(
        &self,
        candidates: &'a [ServerConfig],
        tried: &HashSet<String>,
    ) -> Option<&'a ServerConfig>;
}

/// Store order is priority order.
#[derive(Clone, Copy, Debug, Default)]
pub struct StoreOrder;

impl FailoverPolicy for StoreOrder {
    fn next<'a>(
        &self,
        candidates: &'a [ServerConfig],
        tried: &HashSet<String>,
    ) -> Option<&'a ServerConfig> {
        candidates
            .iter()
            .find(|candidate| !tried.contains(&candidate.id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uri;

    fn servers(count: usize) -> Vec<ServerConfig> {
        (0..count)
            .map(|index| uri::parse(&format!("vless://u@host{index}:443")).unwrap())
            .collect()
    }

    #[test]
    fn returns_first_untried_in_store_order() {
        let candidates = servers(3);
        let mut tried = HashSet::new();

        tried.insert(candidates[0].id.clone());
        assert_eq!(
            StoreOrder.next(&candidates, &tried).map(|s| &s.id),
            Some(&candidates[1].id)
        );

        tried.insert(candidates[1].id.clone());
        assert_eq!(
            StoreOrder.next(&candidates, &tried).map(|s| &s.id),
            Some(&candidates[2].id)
        );
    }

    #[test]
    fn skips_tried_entries_anywhere_in_the_list() {
        let candidates = servers(3);
        let tried = HashSet::from([candidates[2].id.clone()]);
        assert_eq!(
            StoreOrder.next(&candidates, &tried).map(|s| &s.id),
            Some(&candidates[0].id)
        );
    }

    #[test]
    fn exhausted_candidates_yield_none() {
        let candidates = servers(2);
        let tried: HashSet<String> = candidates.iter().map(|s| s.id.clone()).collect();
        assert!(StoreOrder.next(&candidates, &tried).is_none());
        assert!(StoreOrder.next(&[], &HashSet::new()).is_none());
    }
}
