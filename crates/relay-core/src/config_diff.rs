//! Repository configuration diffing
//!
//! Validation and diffing are pure. A list that fails validation is rejected
//! as a whole; nothing from it is applied.

use std::collections::{BTreeMap, HashSet};

use serde::Serialize;

use crate::config::RepositoryConfig;
use crate::error::{Error, Result};

const REQUIRED_FIELDS: [&str; 4] = ["id", "name", "repository_path", "base_branch"];
const STRING_LIST_FIELDS: [&str; 2] = ["labels", "allowed_tools"];

/// Changes between two repository lists, each side sorted by id
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RepositoryDiff {
    pub added: Vec<RepositoryConfig>,
    pub removed: Vec<RepositoryConfig>,
    /// New versions of repositories present in both lists
    pub modified: Vec<RepositoryConfig>,
}

impl RepositoryDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.modified.is_empty()
    }

    pub fn removed_ids(&self) -> HashSet<&str> {
        self.removed.iter().map(|repo| repo.id.as_str()).collect()
    }
}

/// Compare two repository lists keyed by `id`
pub fn diff_repositories(old: &[RepositoryConfig], new: &[RepositoryConfig]) -> RepositoryDiff {
    let old: BTreeMap<&str, &RepositoryConfig> = old.iter().map(|r| (r.id.as_str(), r)).collect();
    let new: BTreeMap<&str, &RepositoryConfig> = new.iter().map(|r| (r.id.as_str(), r)).collect();

    let mut diff = RepositoryDiff::default();
    for (id, repo) in &new {
        match old.get(id) {
            None => diff.added.push((*repo).clone()),
            Some(previous) if previous != repo => diff.modified.push((*repo).clone()),
            Some(_) => {}
        }
    }
    diff.removed = old
        .iter()
        .filter(|(id, _)| !new.contains_key(*id))
        .map(|(_, repo)| (*repo).clone())
        .collect();
    diff
}

/// Structural check of the `repositories` array in a raw config document
///
/// A missing key means "no repositories".
pub fn validate_document(document: &toml::Table) -> Result<()> {
    let Some(repositories) = document.get("repositories") else {
        return Ok(());
    };
    let repositories = repositories
        .as_array()
        .ok_or_else(|| Error::InvalidConfig("`repositories` must be an array".to_string()))?;

    let mut seen = HashSet::new();
    for (position, repo) in repositories.iter().enumerate() {
        let repo = repo.as_table().ok_or_else(|| {
            Error::InvalidConfig(format!("repository #{} must be a table", position))
        })?;

        for field in REQUIRED_FIELDS {
            match repo.get(field).and_then(toml::Value::as_str) {
                Some(value) if !value.trim().is_empty() => {}
                _ => {
                    return Err(Error::InvalidConfig(format!(
                        "repository #{} is missing required string field `{}`",
                        position, field
                    )));
                }
            }
        }
        for field in STRING_LIST_FIELDS {
            if let Some(value) = repo.get(field) {
                let is_string_list = value
                    .as_array()
                    .is_some_and(|items| items.iter().all(toml::Value::is_str));
                if !is_string_list {
                    return Err(Error::InvalidConfig(format!(
                        "repository #{} field `{}` must be an array of strings",
                        position, field
                    )));
                }
            }
        }

        let id = repo.get("id").and_then(toml::Value::as_str).unwrap_or_default();
        if !seen.insert(id.to_string()) {
            return Err(Error::InvalidConfig(format!("duplicate repository id `{}`", id)));
        }
    }
    Ok(())
}

/// Check an already typed repository list
pub fn validate_repositories(repositories: &[RepositoryConfig]) -> Result<()> {
    let mut seen = HashSet::new();
    for repo in repositories {
        let fields = [
            ("id", repo.id.as_str()),
            ("name", repo.name.as_str()),
            ("base_branch", repo.base_branch.as_str()),
        ];
        for (field, value) in fields {
            if value.trim().is_empty() {
                return Err(Error::InvalidConfig(format!(
                    "repository `{}` has an empty `{}`",
                    repo.id, field
                )));
            }
        }
        if repo.repository_path.as_os_str().is_empty() {
            return Err(Error::InvalidConfig(format!(
                "repository `{}` has an empty `repository_path`",
                repo.id
            )));
        }
        if !seen.insert(repo.id.as_str()) {
            return Err(Error::InvalidConfig(format!("duplicate repository id `{}`", repo.id)));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repo(id: &str) -> RepositoryConfig {
        RepositoryConfig::new(id, id.to_uppercase(), format!("/src/{id}"), "main")
    }

    fn ids(repos: &[RepositoryConfig]) -> Vec<&str> {
        repos.iter().map(|r| r.id.as_str()).collect()
    }

    #[test]
    fn test_diff_added_removed_modified() {
        let old = vec![repo("a"), repo("b"), repo("c")];
        let mut changed = repo("b");
        changed.base_branch = "develop".to_string();
        let new = vec![repo("d"), changed, repo("a")];

        let diff = diff_repositories(&old, &new);

        assert_eq!(ids(&diff.added), vec!["d"]);
        assert_eq!(ids(&diff.removed), vec!["c"]);
        assert_eq!(ids(&diff.modified), vec!["b"]);
        assert_eq!(diff.modified[0].base_branch, "develop");
        assert_eq!(diff.removed_ids(), HashSet::from(["c"]));
    }

    #[test]
    fn test_diff_identical_lists_is_empty() {
        let list = vec![repo("a"), repo("b")];
        assert!(diff_repositories(&list, &list.clone()).is_empty());
    }

    #[test]
    fn test_extra_keys_count_as_modification() {
        let old = vec![repo("a")];
        let mut tagged = repo("a");
        tagged
            .extra
            .insert("team_keys".to_string(), toml::Value::Array(vec!["ENG".into()]));

        let diff = diff_repositories(&old, &[tagged]);

        assert_eq!(ids(&diff.modified), vec!["a"]);
    }

    #[test]
    fn test_validate_document_shapes() {
        let valid: toml::Table = toml::from_str(
            r#"
[[repositories]]
id = "a"
name = "A"
repository_path = "/src/a"
base_branch = "main"
labels = ["x"]
"#,
        )
        .unwrap();
        assert!(validate_document(&valid).is_ok());
        assert!(validate_document(&toml::Table::new()).is_ok());

        let cases = [
            "repositories = \"nope\"",
            "repositories = [1]",
            "[[repositories]]\nid = \"a\"\nname = \"A\"\nrepository_path = \"/a\"",
            "[[repositories]]\nid = \"a\"\nname = \"A\"\nrepository_path = \"/a\"\nbase_branch = \"main\"\nlabels = \"x\"",
            "[[repositories]]\nid = \"a\"\nname = \"A\"\nrepository_path = \"/a\"\nbase_branch = \"main\"\n\
             [[repositories]]\nid = \"a\"\nname = \"B\"\nrepository_path = \"/b\"\nbase_branch = \"main\"",
        ];
        for case in cases {
            let document: toml::Table = toml::from_str(case).unwrap();
            assert!(
                matches!(validate_document(&document), Err(Error::InvalidConfig(_))),
                "expected rejection for {case}"
            );
        }
    }

    #[test]
    fn test_validate_typed_list() {
        assert!(validate_repositories(&[repo("a"), repo("b")]).is_ok());
        assert!(validate_repositories(&[repo("a"), repo("a")]).is_err());

        let mut blank = repo("c");
        blank.name = " ".to_string();
        assert!(matches!(
            validate_repositories(&[blank]),
            Err(Error::InvalidConfig(_))
        ));
    }
}
