use std::collections::HashSet;

/// Client keys exempt from rate limiting.
///
/// Entries are full client keys as produced by the identity resolver, for
/// example `api_key:internal-batch` or `ip:10.0.0.5`.
#[derive(Debug, Clone, Default)]
pub struct Whitelist {
    clients: HashSet<String>,
}

impl Whitelist {
    pub fn new<I, S>(clients: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            clients: clients
                .into_iter()
                .map(Into::into)
                .map(|c| c.trim().to_string())
                .filter(|c| !c.is_empty())
                .collect(),
        }
    }

    pub fn is_exempt(&self, client_key: &str) -> bool {
        self.clients.contains(client_key)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}
