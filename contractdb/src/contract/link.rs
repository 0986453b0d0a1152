use super::Contract;
use chrono::{DateTime, Utc};
use serde_json::Value;

/// Type of the contracts that describe links between other contracts.
pub const LINK_TYPE: &str = "link@1.0.0";

/// The parts of a link contract the store needs.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkContract {
    pub id: String,
    pub name: String,
    pub inverse_name: String,
    pub from_id: String,
    pub to_id: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

impl LinkContract {
    /// Read a link out of a contract of type `link`. Returns `None` when the
    /// contract is not a well-formed link.
    pub fn from_contract(contract: &Contract) -> Option<Self> {
        if contract.contract_type.split('@').next() != Some("link") {
            return None;
        }
        let endpoint = |side: &str| -> Option<String> {
            match contract.data.get(side)? {
                Value::String(id) => Some(id.clone()),
                Value::Object(map) => map.get("id")?.as_str().map(str::to_string),
                _ => None,
            }
        };

        Some(LinkContract {
            id: contract.id.clone(),
            name: contract.name.clone()?,
            inverse_name: contract.data.get("inverseName")?.as_str()?.to_string(),
            from_id: endpoint("from")?,
            to_id: endpoint("to")?,
            active: contract.active,
            created_at: contract.created_at,
        })
    }

    /// The id of the contract at the other end of the link, seen from `id`.
    pub fn other_end(&self, id: &str) -> Option<&str> {
        if self.from_id == id {
            Some(&self.to_id)
        } else if self.to_id == id {
            Some(&self.from_id)
        } else {
            None
        }
    }
}

/// A link as seen from one of its endpoints.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkedRef {
    /// The forward name when seen from the `from` side, the inverse name
    /// when seen from the `to` side.
    pub name: String,
    pub id: String,
    pub created_at: DateTime<Utc>,
}

/// Resolve how `link` looks from the contract with id `contract_id`.
pub fn parse_link(link: &LinkContract, contract_id: &str) -> Option<LinkedRef> {
    if link.from_id == contract_id {
        return Some(LinkedRef {
            name: link.name.clone(),
            id: link.to_id.clone(),
            created_at: link.created_at,
        });
    }
    if link.to_id == contract_id {
        return Some(LinkedRef {
            name: link.inverse_name.clone(),
            id: link.from_id.clone(),
            created_at: link.created_at,
        });
    }
    None
}

/// Record on `contract` that it was linked through `link`.
pub fn stamp_linked_at(link: &LinkContract, contract: &mut Contract) -> bool {
    match parse_link(link, &contract.id) {
        Some(linked) => {
            contract.linked_at.insert(linked.name, linked.created_at);
            true
        }
        None => false,
    }
}

/// Older link contracts carry unversioned endpoint types; pin them to 1.0.0.
pub fn normalize_endpoint_types(contract: &mut Contract) {
    if contract.contract_type != LINK_TYPE {
        return;
    }
    for side in ["from", "to"] {
        if let Some(Value::String(t)) = contract.data.get_mut(side).and_then(|e| e.get_mut("type")) {
            if !t.contains('@') {
                t.push_str("@1.0.0");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn link() -> Contract {
        Contract::from_partial(json!({
            "slug": "link-1",
            "type": "link@1.0.0",
            "name": "is attached to",
            "data": {
                "inverseName": "has attached element",
                "from": { "id": "a", "type": "message" },
                "to": { "id": "b", "type": "thread@1.0.0" },
            }
        }))
        .unwrap()
    }

    #[test]
    fn test_from_contract() {
        let parsed = LinkContract::from_contract(&link()).unwrap();
        assert_eq!(parsed.name, "is attached to");
        assert_eq!(parsed.inverse_name, "has attached element");
        assert_eq!(parsed.from_id, "a");
        assert_eq!(parsed.to_id, "b");
    }

    #[test]
    fn test_non_link_is_ignored() {
        let card = Contract::from_partial(json!({ "slug": "x", "type": "card@1.0.0" })).unwrap();
        assert!(LinkContract::from_contract(&card).is_none());
    }

    #[test]
    fn test_parse_link_from_both_sides() {
        let parsed = LinkContract::from_contract(&link()).unwrap();

        let from_side = parse_link(&parsed, "a").unwrap();
        assert_eq!(from_side.name, "is attached to");
        assert_eq!(from_side.id, "b");

        let to_side = parse_link(&parsed, "b").unwrap();
        assert_eq!(to_side.name, "has attached element");
        assert_eq!(to_side.id, "a");

        assert!(parse_link(&parsed, "c").is_none());
        assert_eq!(parsed.other_end("a"), Some("b"));
        assert_eq!(parsed.other_end("c"), None);
    }

    #[test]
    fn test_stamp_linked_at() {
        let parsed = LinkContract::from_contract(&link()).unwrap();
        let mut card = Contract::from_partial(json!({
            "id": "b", "slug": "thread", "type": "thread@1.0.0"
        }))
        .unwrap();
        assert!(stamp_linked_at(&parsed, &mut card));
        assert!(card.linked_at.contains_key("has attached element"));
    }

    #[test]
    fn test_normalize_endpoint_types() {
        let mut contract = link();
        normalize_endpoint_types(&mut contract);
        assert_eq!(contract.data["from"]["type"], "message@1.0.0");
        assert_eq!(contract.data["to"]["type"], "thread@1.0.0");
    }
}
