// Built-in contracts - the types, role and user every store starts with

use serde_json::{json, Value};

pub const ADMIN_USER_SLUG: &str = "user-admin";
pub const ADMIN_ROLE_SLUG: &str = "role-user-admin";
pub const ADMIN_SESSION_SLUG: &str = "session-admin-kernel";

/// Types the kernel itself relies on, bootstrapped before anything else.
pub fn core_types() -> Vec<Value> {
    vec![type_type(), session(), user(), role()]
}

/// The remaining built-in types.
pub fn extra_types() -> Vec<Value> {
    vec![card(), org(), view(), link()]
}

pub fn type_type() -> Value {
    json!({
        "slug": "type",
        "type": "type@1.0.0",
        "name": "Contract type",
        "data": {
            "schema": {
                "type": "object",
                "properties": {
                    "slug": { "type": "string", "pattern": "^[a-z0-9-]+$" },
                    "type": { "type": "string", "enum": ["type", "type@1.0.0"] },
                    "data": {
                        "type": "object",
                        "properties": {
                            "schema": { "type": "object" },
                            "uiSchema": { "type": "object" },
                            "indexed_fields": {
                                "type": "array",
                                "items": { "type": "array", "items": { "type": "string" } }
                            }
                        },
                        "required": ["schema"]
                    }
                },
                "required": ["slug", "type", "data"]
            }
        }
    })
}

pub fn session() -> Value {
    json!({
        "slug": "session",
        "type": "type@1.0.0",
        "name": "Session",
        "data": {
            "schema": {
                "type": "object",
                "properties": {
                    "data": {
                        "type": "object",
                        "properties": {
                            "actor": { "type": "string", "format": "uuid" },
                            "expiration": { "type": "string", "format": "date-time" },
                            "scope": { "type": "object" },
                            "token": {
                                "type": "object",
                                "properties": { "authentication": { "type": "string" } }
                            }
                        },
                        "required": ["actor"]
                    }
                },
                "required": ["data"]
            }
        }
    })
}

pub fn user() -> Value {
    json!({
        "slug": "user",
        "type": "type@1.0.0",
        "name": "User",
        "data": {
            "schema": {
                "type": "object",
                "properties": {
                    "slug": { "type": "string", "pattern": "^user-[a-zA-Z0-9-]+$" },
                    "data": {
                        "type": "object",
                        "properties": {
                            "email": {
                                "anyOf": [
                                    { "type": "string", "format": "email" },
                                    { "type": "array", "items": { "type": "string", "format": "email" } }
                                ]
                            },
                            "hash": { "type": "string" },
                            "roles": {
                                "type": "array",
                                "items": { "type": "string", "pattern": "^[a-z0-9-]+$" }
                            }
                        },
                        "required": ["roles"]
                    }
                },
                "required": ["slug", "data"]
            }
        }
    })
}

pub fn role() -> Value {
    json!({
        "slug": "role",
        "type": "type@1.0.0",
        "name": "Role",
        "data": {
            "schema": {
                "type": "object",
                "properties": {
                    "slug": { "type": "string", "pattern": "^role-[a-z0-9-]+$" },
                    "data": {
                        "type": "object",
                        "properties": { "read": { "type": ["object", "boolean"] } },
                        "required": ["read"]
                    }
                },
                "required": ["slug", "data"]
            }
        }
    })
}

pub fn card() -> Value {
    json!({
        "slug": "card",
        "type": "type@1.0.0",
        "name": "Card",
        "data": {
            "schema": {
                "type": "object",
                "properties": { "data": { "type": "object" } }
            }
        }
    })
}

pub fn org() -> Value {
    json!({
        "slug": "org",
        "type": "type@1.0.0",
        "name": "Organisation",
        "data": {
            "schema": {
                "type": "object",
                "properties": {
                    "markers": {
                        "type": "array",
                        "items": { "type": "string", "pattern": "^[a-zA-Z0-9-_/:+]+$" }
                    },
                    "name": { "type": "string", "fullTextSearch": true },
                    "data": {
                        "type": "object",
                        "properties": {
                            "profile": {
                                "type": "object",
                                "properties": { "description": { "type": "string" } }
                            }
                        }
                    }
                },
                "required": ["name"]
            }
        }
    })
}

pub fn view() -> Value {
    let branches = json!({
        "type": "array",
        "items": {
            "type": "object",
            "properties": {
                "name": { "type": "string" },
                "schema": { "type": "object" }
            },
            "required": ["name", "schema"]
        }
    });
    json!({
        "slug": "view",
        "type": "type@1.0.0",
        "name": "View",
        "data": {
            "schema": {
                "type": "object",
                "properties": {
                    "data": {
                        "type": "object",
                        "properties": {
                            "schema": { "type": "object" },
                            "allOf": branches,
                            "anyOf": branches,
                            "types": { "type": "array", "items": { "type": "string" } }
                        }
                    }
                },
                "required": ["data"]
            }
        }
    })
}

pub fn link() -> Value {
    let endpoint = json!({
        "type": "object",
        "properties": {
            "id": { "type": "string", "format": "uuid" },
            "type": { "type": "string", "pattern": "^[a-z0-9-]+@[0-9.]+$" }
        },
        "required": ["id", "type"]
    });
    json!({
        "slug": "link",
        "type": "type@1.0.0",
        "name": "Link",
        "data": {
            "schema": {
                "type": "object",
                "properties": {
                    "name": { "type": "string" },
                    "data": {
                        "type": "object",
                        "properties": {
                            "inverseName": { "type": "string" },
                            "from": endpoint,
                            "to": endpoint
                        },
                        "required": ["inverseName", "from", "to"]
                    }
                },
                "required": ["name", "data"]
            }
        }
    })
}

/// The role of the admin user: everything is readable.
pub fn role_user_admin() -> Value {
    json!({
        "slug": ADMIN_ROLE_SLUG,
        "type": "role@1.0.0",
        "name": "Admin role permissions",
        "data": {
            "read": { "type": "object", "additionalProperties": true }
        }
    })
}

pub fn user_admin() -> Value {
    json!({
        "slug": ADMIN_USER_SLUG,
        "type": "user@1.0.0",
        "name": "Admin",
        "data": {
            "email": "admin@example.com",
            "hash": "PASSWORDLESS",
            "roles": []
        }
    })
}

pub fn admin_session(actor_id: &str) -> Value {
    json!({
        "slug": ADMIN_SESSION_SLUG,
        "type": "session@1.0.0",
        "data": { "actor": actor_id }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::Contract;
    use crate::schema::Schema;

    #[test]
    fn test_every_type_schema_parses() {
        for definition in core_types().into_iter().chain(extra_types()) {
            let contract = Contract::from_partial(definition).unwrap();
            let schema = contract.type_schema().unwrap().clone();
            Schema::from_value(schema).unwrap();
        }
    }

    #[test]
    fn test_type_slugs_are_unique() {
        let mut slugs: Vec<String> = core_types()
            .into_iter()
            .chain(extra_types())
            .map(|c| c["slug"].as_str().unwrap().to_string())
            .collect();
        let total = slugs.len();
        slugs.sort();
        slugs.dedup();
        assert_eq!(slugs.len(), total);
    }
}
