use crate::config::Settings;

/// Browser-derived context embedded into analysis prompts. Large payloads are
/// truncated to the configured thresholds before they reach the external tool.
#[derive(Debug, Clone, Default)]
pub struct PageContext {
    pub url: String,
    pub title: String,
    pub page_text: String,
    pub console_output: String,
}

/// Prompt for running a testing goal against the current page.
pub fn test_goal_prompt(settings: &Settings, goal: &str, context: &PageContext) -> String {
    let page_text = truncate_context(&context.page_text, settings.page_text_limit);
    let console_output = truncate_context(&context.console_output, settings.console_text_limit);
    format!(
        "You are assisting with automated testing of a web application.\n\
         Goal: {goal}\n\n\
         Current page: {url} ({title})\n\n\
         Visible page text:\n{page_text}\n\n\
         Console output:\n{console_output}\n\n\
         Report the concrete steps you would take, what you observed, and whether \
         the goal is satisfied. Flag anything that looks broken.",
        goal = goal,
        url = context.url,
        title = context.title,
        page_text = page_text,
        console_output = console_output,
    )
}

/// Prompt for diagnosing a failed run from its captured output.
pub fn failure_analysis_prompt(settings: &Settings, goal: &str, captured_output: &str) -> String {
    let output = truncate_context(captured_output, settings.console_text_limit);
    format!(
        "A testing run did not complete successfully.\n\
         Goal: {goal}\n\n\
         Captured output:\n{output}\n\n\
         Identify the most likely cause and suggest the next step.",
    )
}

/// Bound a context payload, noting how much was dropped.
pub fn truncate_context(text: &str, limit: usize) -> String {
    let total = text.chars().count();
    if total <= limit {
        return text.to_string();
    }
    let prefix: String = text.chars().take(limit).collect();
    format!("{prefix}... [truncated {} chars]", total - limit)
}
