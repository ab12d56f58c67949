//! Skill registry: named prompt templates clients materialize into prompts.

use std::collections::HashMap;
use std::sync::Mutex;

use sandbox_core::util::now_ts;
use serde::{Deserialize, Serialize};

use crate::error::{CollabError, Result};

#[derive(Clone, Debug, Serialize)]
pub struct Skill {
    pub name: String,
    pub description: String,
    /// Prompt template with `{placeholder}` slots.
    pub template: String,
    pub created_at: u64,
    pub updated_at: u64,
}

#[derive(Clone, Debug, Deserialize)]
pub struct SkillInput {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub template: String,
}

#[derive(Default)]
pub struct SkillStore {
    skills: Mutex<HashMap<String, Skill>>,
}

impl SkillStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self, input: SkillInput) -> Result<Skill> {
        if input.name.trim().is_empty() {
            return Err(CollabError::Validation("Skill name is required".into()));
        }
        let mut skills = self.skills.lock().unwrap();
        if skills.contains_key(&input.name) {
            return Err(CollabError::Conflict(format!(
                "Skill '{}' already exists",
                input.name
            )));
        }
        let now = now_ts();
        let skill = Skill {
            name: input.name.clone(),
            description: input.description,
            template: input.template,
            created_at: now,
            updated_at: now,
        };
        skills.insert(input.name, skill.clone());
        Ok(skill)
    }

    pub fn list(&self) -> Vec<Skill> {
        let mut skills: Vec<Skill> = self.skills.lock().unwrap().values().cloned().collect();
        skills.sort_by(|a, b| a.name.cmp(&b.name));
        skills
    }

    pub fn get(&self, name: &str) -> Option<Skill> {
        self.skills.lock().unwrap().get(name).cloned()
    }

    pub fn update(&self, name: &str, description: Option<String>, template: Option<String>) -> Result<Skill> {
        let mut skills = self.skills.lock().unwrap();
        let skill = skills
            .get_mut(name)
            .ok_or_else(|| CollabError::NotFound(format!("Skill '{name}' not found")))?;
        if let Some(description) = description {
            skill.description = description;
        }
        if let Some(template) = template {
            skill.template = template;
        }
        skill.updated_at = now_ts();
        Ok(skill.clone())
    }

    pub fn delete(&self, name: &str) -> bool {
        self.skills.lock().unwrap().remove(name).is_some()
    }

    /// Materialize the template, substituting `{key}` for each argument.
    pub fn invoke(&self, name: &str, args: &HashMap<String, String>) -> Result<String> {
        let skill = self
            .get(name)
            .ok_or_else(|| CollabError::NotFound(format!("Skill '{name}' not found")))?;
        let mut prompt = skill.template;
        for (key, value) in args {
            prompt = prompt.replace(&format!("{{{key}}}"), value);
        }
        Ok(prompt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with_skill() -> SkillStore {
        let store = SkillStore::new();
        store
            .create(SkillInput {
                name: "review".into(),
                description: "Review a file".into(),
                template: "Review {file} focusing on {focus}.".into(),
            })
            .unwrap();
        store
    }

    #[test]
    fn create_rejects_duplicates_and_blank_names() {
        let store = store_with_skill();
        let duplicate = store.create(SkillInput {
            name: "review".into(),
            description: String::new(),
            template: "x".into(),
        });
        assert!(matches!(duplicate, Err(CollabError::Conflict(_))));

        let blank = store.create(SkillInput {
            name: "  ".into(),
            description: String::new(),
            template: "x".into(),
        });
        assert!(matches!(blank, Err(CollabError::Validation(_))));
    }

    #[test]
    fn invoke_substitutes_arguments() {
        let store = store_with_skill();
        let mut args = HashMap::new();
        args.insert("file".to_string(), "src/main.rs".to_string());
        args.insert("focus".to_string(), "error handling".to_string());
        let prompt = store.invoke("review", &args).unwrap();
        assert_eq!(prompt, "Review src/main.rs focusing on error handling.");
    }

    #[test]
    fn invoke_unknown_is_not_found() {
        let store = SkillStore::new();
        assert!(matches!(
            store.invoke("ghost", &HashMap::new()),
            Err(CollabError::NotFound(_))
        ));
    }

    #[test]
    fn update_and_delete() {
        let store = store_with_skill();
        let updated = store
            .update("review", None, Some("New {file} template".into()))
            .unwrap();
        assert_eq!(updated.template, "New {file} template");
        assert_eq!(updated.description, "Review a file");

        assert!(store.delete("review"));
        assert!(!store.delete("review"));
        assert!(store.get("review").is_none());
    }
}
