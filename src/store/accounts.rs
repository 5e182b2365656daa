use super::{parse_rows, FileBacked};
use crate::limit::Limit;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::error;

/// 账号
#[derive(Debug)]
pub struct Account {
    pub username: String,
    pub password: String,
    pub limit: Arc<Limit>,
}

/// 账号存储，按用户名索引
#[derive(Debug, Default)]
pub struct AccountStore {
    accounts: RwLock<Arc<HashMap<String, Arc<Account>>>>,
}

fn parse_credential(s: &str) -> Option<(&str, &str)> {
    let mut fields = s.split(':').filter(|f| !f.is_empty());
    match (fields.next(), fields.next(), fields.next()) {
        (Some(user), Some(pass), None) => Some((user, pass)),
        _ => None,
    }
}

impl AccountStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 解析账号文件内容
    pub fn parse(text: &str) -> HashMap<String, Arc<Account>> {
        let mut accounts = HashMap::new();
        for row in parse_rows(Self::KIND, text) {
            let Some((username, password)) = parse_credential(row.key) else {
                error!("{} line {}: invalid secret: {}", Self::KIND, row.line, row.key);
                continue;
            };
            if accounts.contains_key(username) {
                error!(
                    "{} line {}: duplicate account name: {}",
                    Self::KIND,
                    row.line,
                    username
                );
                continue;
            }
            accounts.insert(
                username.to_string(),
                Arc::new(Account {
                    username: username.to_string(),
                    password: password.to_string(),
                    limit: Arc::new(row.limit),
                }),
            );
        }
        accounts
    }

    /// 整体替换
    pub fn swap(&self, accounts: HashMap<String, Arc<Account>>) {
        *self.accounts.write() = Arc::new(accounts);
    }

    /// 校验用户名和密码
    pub fn verify(&self, username: &str, password: &str) -> Option<Arc<Account>> {
        self.accounts
            .read()
            .get(username)
            .filter(|a| a.password == password)
            .cloned()
    }

    /// 遍历所有账号
    pub fn range<F: FnMut(&Account)>(&self, mut f: F) {
        let accounts = self.accounts.read().clone();
        for account in accounts.values() {
            f(account);
        }
    }

    pub fn len(&self) -> usize {
        self.accounts.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.read().is_empty()
    }
}

impl FileBacked for AccountStore {
    const KIND: &'static str = "accounts";

    fn load_str(&self, text: &str) -> usize {
        let accounts = Self::parse(text);
        let n = accounts.len();
        self.swap(accounts);
        n
    }

    fn clear(&self) {
        self.swap(HashMap::new());
    }
}
