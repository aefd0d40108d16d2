use redraft_core::config::PromptsConfig;

pub const CONTENT_PLACEHOLDER: &str = "{content}";

const PLAN: &str = "You are an expert writer tasked with writing a high level outline of an article. \
Write such an outline for the user provided topic. Give the outline along with any relevant notes \
or instructions for each section and its headings.";

const RESEARCH_PLAN: &str = "You are a researcher charged with providing information that can \
be used when writing the following article. Generate a list of search queries that will gather \
any relevant information. Only generate 3 queries max.";

const WRITER: &str = "You are a writing assistant tasked with writing excellent articles with proper headings. \
Generate the best article possible for the user's request and the initial outline. \
If the user provides critique, respond with a revised version of your previous attempts. \
Use all the information below as needed:\n\n------\n\n{content}";

const REFLECTION: &str = "You are a senior editor grading an article submission. \
Generate critique and recommendations for the user's submission. \
Provide detailed recommendations, including requests for length, depth, structure and style.";

const RESEARCH_CRITIQUE: &str = "You are a researcher charged with providing information that can \
be used when making any requested revisions (as outlined below). \
Generate a list of search queries that will gather any relevant information. Only generate 3 queries max.";

/// System instructions for the five nodes.
#[derive(Debug, Clone, PartialEq)]
pub struct Prompts {
    pub plan: String,
    pub research_plan: String,
    /// Contains `{content}`, replaced by the joined reference snippets.
    pub writer: String,
    pub reflection: String,
    pub research_critique: String,
}

impl Default for Prompts {
    fn default() -> Self {
        Self {
            plan: PLAN.to_string(),
            research_plan: RESEARCH_PLAN.to_string(),
            writer: WRITER.to_string(),
            reflection: REFLECTION.to_string(),
            research_critique: RESEARCH_CRITIQUE.to_string(),
        }
    }
}

impl Prompts {
    /// Built-in prompts with any configured overrides applied.
    pub fn from_config(config: &PromptsConfig) -> Self {
        let defaults = Self::default();
        Self {
            plan: config.plan.clone().unwrap_or(defaults.plan),
            research_plan: config.research_plan.clone().unwrap_or(defaults.research_plan),
            writer: config.writer.clone().unwrap_or(defaults.writer),
            reflection: config.reflection.clone().unwrap_or(defaults.reflection),
            research_critique: config
                .research_critique
                .clone()
                .unwrap_or(defaults.research_critique),
        }
    }
}

/// Substitute the joined reference snippets into a writer instruction.
pub fn fill_content(template: &str, content: &str) -> String {
    template.replace(CONTENT_PLACEHOLDER, content)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_writer_has_placeholder() {
        assert!(Prompts::default().writer.contains(CONTENT_PLACEHOLDER));
    }

    #[test]
    fn test_overrides_replace_only_set_fields() {
        let config = PromptsConfig {
            plan: Some("Outline it.".into()),
            writer: Some("Write using:\n{content}".into()),
            ..Default::default()
        };
        let prompts = Prompts::from_config(&config);
        assert_eq!(prompts.plan, "Outline it.");
        assert_eq!(prompts.reflection, Prompts::default().reflection);
        assert_eq!(fill_content(&prompts.writer, "a\n\nb"), "Write using:\na\n\nb");
    }
}
