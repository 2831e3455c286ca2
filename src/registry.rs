use dashmap::DashMap;
use std::collections::HashMap;

use crate::ipc::{CommandDecl, RouteDecl};

/// A registered HTTP route owned by a module.
#[derive(Debug, Clone)]
pub struct RouteEntry {
    pub module: String,
    pub method: String,
    /// Module-relative path pattern; `:name` segments capture parameters.
    pub path: String,
    pub handler_id: String,
    pub requires_auth: bool,
}

/// A registered WebSocket command owned by a module.
#[derive(Debug, Clone)]
pub struct CommandEntry {
    pub module: String,
    /// Full name as clients send it: `<module>.<cmd>` or `@ns/<mod>.<cmd>`.
    pub full_name: String,
    pub handler_id: String,
    pub broadcast: bool,
    pub requires_auth: bool,
}

/// A successful route lookup: the entry plus captured `:param` values.
#[derive(Debug, Clone)]
pub struct RouteMatch {
    pub entry: RouteEntry,
    pub params: HashMap<String, String>,
}

/// Process-wide tables mapping HTTP routes and WS command names to module
/// handlers. Mutated only by `register` handling and supervisor cleanup;
/// read on every request.
#[derive(Default)]
pub struct CommandRegistry {
    /// Keyed by `(module, METHOD, path pattern)`.
    routes: DashMap<(String, String, String), RouteEntry>,
    commands: DashMap<String, CommandEntry>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a module's declared routes and commands. Idempotent: a later
    /// registration for the same `(module, method, path)` or command name
    /// replaces the earlier one, which is how sibling instances of one module
    /// all end up behind a single table entry.
    pub fn install(&self, module: &str, routes: &[RouteDecl], commands: &[CommandDecl]) {
        for route in routes {
            let method = route.method.to_ascii_uppercase();
            if !matches!(method.as_str(), "GET" | "POST" | "PUT" | "DELETE") {
                tracing::warn!(
                    "Module '{module}' declared unsupported method {} for {}; ignoring",
                    route.method,
                    route.path
                );
                continue;
            }

            let entry = RouteEntry {
                module: module.to_string(),
                method: method.clone(),
                path: normalize_path(&route.path),
                handler_id: route.handler_id.clone(),
                requires_auth: route.requires_auth,
            };
            self.routes
                .insert((module.to_string(), method, entry.path.clone()), entry);
        }

        for command in commands {
            let full_name = format!("{module}.{}", command.name);
            let entry = CommandEntry {
                module: module.to_string(),
                full_name: full_name.clone(),
                handler_id: command.handler_id.clone(),
                broadcast: command.broadcast,
                requires_auth: command.requires_auth,
            };
            self.commands.insert(full_name, entry);
        }
    }

    /// Remove everything a module registered. Called when its last instance
    /// dies.
    pub fn remove_module(&self, module: &str) {
        self.routes.retain(|_, entry| entry.module != module);
        self.commands.retain(|_, entry| entry.module != module);
    }

    /// Match `method path` within a module's route set, capturing `:param`
    /// segments.
    pub fn lookup_route(&self, module: &str, method: &str, path: &str) -> Option<RouteMatch> {
        let method = method.to_ascii_uppercase();
        let path = normalize_path(path);

        // Exact pattern first; cheaper and unambiguous.
        if let Some(entry) = self
            .routes
            .get(&(module.to_string(), method.clone(), path.clone()))
        {
            return Some(RouteMatch {
                entry: entry.clone(),
                params: HashMap::new(),
            });
        }

        for entry in self.routes.iter() {
            if entry.module != module || entry.method != method {
                continue;
            }
            if let Some(params) = match_pattern(&entry.path, &path) {
                return Some(RouteMatch {
                    entry: entry.clone(),
                    params,
                });
            }
        }

        None
    }

    pub fn lookup_command(&self, full_name: &str) -> Option<CommandEntry> {
        self.commands.get(full_name).map(|e| e.clone())
    }

    pub fn route_count(&self) -> usize {
        self.routes.len()
    }

    pub fn command_count(&self) -> usize {
        self.commands.len()
    }
}

fn normalize_path(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.starts_with('/') {
        trimmed.to_string()
    } else if trimmed.is_empty() {
        "/".to_string()
    } else {
        format!("/{trimmed}")
    }
}

/// Segment-wise pattern match; `:name` captures one segment.
fn match_pattern(pattern: &str, path: &str) -> Option<HashMap<String, String>> {
    let pattern_segments: Vec<&str> = pattern.split('/').filter(|s| !s.is_empty()).collect();
    let path_segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

    if pattern_segments.len() != path_segments.len() {
        return None;
    }

    let mut params = HashMap::new();
    for (pat, got) in pattern_segments.iter().zip(&path_segments) {
        if let Some(name) = pat.strip_prefix(':') {
            params.insert(name.to_string(), (*got).to_string());
        } else if pat != got {
            return None;
        }
    }

    Some(params)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(method: &str, path: &str, handler: &str) -> RouteDecl {
        RouteDecl {
            method: method.to_string(),
            path: path.to_string(),
            handler_id: handler.to_string(),
            requires_auth: false,
        }
    }

    fn command(name: &str, handler: &str, broadcast: bool) -> CommandDecl {
        CommandDecl {
            name: name.to_string(),
            handler_id: handler.to_string(),
            broadcast,
            requires_auth: false,
        }
    }

    #[test]
    fn register_then_lookup_returns_handler() {
        let registry = CommandRegistry::new();
        registry.install("fake", &[route("GET", "/ping", "h1")], &[]);

        let found = registry.lookup_route("fake", "get", "/ping").unwrap();
        assert_eq!(found.entry.handler_id, "h1");
        assert!(found.params.is_empty());
    }

    #[test]
    fn reregistration_replaces_handler() {
        let registry = CommandRegistry::new();
        registry.install("fake", &[route("GET", "/ping", "h1")], &[]);
        registry.install("fake", &[route("GET", "/ping", "h2")], &[]);

        assert_eq!(registry.route_count(), 1);
        let found = registry.lookup_route("fake", "GET", "/ping").unwrap();
        assert_eq!(found.entry.handler_id, "h2");
    }

    #[test]
    fn param_segments_capture() {
        let registry = CommandRegistry::new();
        registry.install("users", &[route("GET", "/profile/:id", "h1")], &[]);

        let found = registry
            .lookup_route("users", "GET", "/profile/abc123")
            .unwrap();
        assert_eq!(found.params.get("id").map(String::as_str), Some("abc123"));

        assert!(registry.lookup_route("users", "GET", "/profile").is_none());
        assert!(registry
            .lookup_route("users", "GET", "/profile/a/b")
            .is_none());
    }

    #[test]
    fn unsupported_method_is_ignored() {
        let registry = CommandRegistry::new();
        registry.install("fake", &[route("PATCH", "/x", "h1")], &[]);
        assert_eq!(registry.route_count(), 0);
    }

    #[test]
    fn command_names_are_prefixed_with_module() {
        let registry = CommandRegistry::new();
        registry.install("chat", &[], &[command("send", "h1", true)]);
        registry.install("@acme/beta", &[], &[command("sync", "h2", false)]);

        let entry = registry.lookup_command("chat.send").unwrap();
        assert_eq!(entry.handler_id, "h1");
        assert!(entry.broadcast);

        let entry = registry.lookup_command("@acme/beta.sync").unwrap();
        assert_eq!(entry.module, "@acme/beta");
        assert!(registry.lookup_command("chat.sync").is_none());
    }

    #[test]
    fn remove_module_clears_both_tables() {
        let registry = CommandRegistry::new();
        registry.install(
            "a",
            &[route("GET", "/x", "h1")],
            &[command("go", "h2", false)],
        );
        registry.install("b", &[route("GET", "/y", "h3")], &[]);

        registry.remove_module("a");

        assert!(registry.lookup_route("a", "GET", "/x").is_none());
        assert!(registry.lookup_command("a.go").is_none());
        assert!(registry.lookup_route("b", "GET", "/y").is_some());
    }

    #[test]
    fn trailing_slashes_are_normalized() {
        let registry = CommandRegistry::new();
        registry.install("fake", &[route("GET", "ping/", "h1")], &[]);
        assert!(registry.lookup_route("fake", "GET", "/ping").is_some());
    }
}
