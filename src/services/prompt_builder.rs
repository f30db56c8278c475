//! 提示词构建
//!
//! 按章节类型生成 system / user 提示词，以及只针对未通过检查项的重写提示词

use std::fmt::Write;

use crate::models::{SectionType, Source};
use crate::services::quality_gate::QualityCheck;

/// 章节生成所需的全部输入
#[derive(Debug, Clone)]
pub struct PromptInput<'a> {
    pub keyword: &'a str,
    pub section_type: SectionType,
    pub title: &'a str,
    pub parent_title: Option<&'a str>,
    pub context: &'a str,
    pub sources: &'a [Source],
    pub target_words: u32,
}

pub fn system_prompt(section_type: SectionType) -> String {
    let role = match section_type {
        SectionType::Introduction => {
            "You write article introductions. Hook the reader, state what the article covers and \
             mention the focus keyword naturally once. Do not add a heading."
        }
        SectionType::H2 => {
            "You write one main section of a long-form article. Start with a `## ` heading using \
             the given title. Support factual claims with numbered citations like [1] that refer \
             to the provided sources."
        }
        SectionType::H3 => {
            "You write one subsection of a long-form article. Start with a `### ` heading using \
             the given title, stay inside the scope of the parent section and cite the provided \
             sources with numbered markers like [1]."
        }
        SectionType::Conclusion => {
            "You write article conclusions. Summarize the key points already covered without \
             repeating sentences and end with a practical takeaway."
        }
        SectionType::Faq => {
            "You write FAQ sections. Produce 4 to 6 questions as `### ` headings ending with a \
             question mark, each followed by a concise answer."
        }
    };
    format!(
        "{}\nWrite in markdown. Never use a top-level `# ` heading. Avoid repeating the keyword \
         more often than reads naturally.",
        role
    )
}

pub fn user_prompt(input: &PromptInput<'_>) -> String {
    let mut prompt = String::new();
    let _ = writeln!(prompt, "Article keyword: {}", input.keyword);
    let _ = writeln!(prompt, "Section ({}): {}", input.section_type.label(), input.title);
    if let Some(parent) = input.parent_title {
        let _ = writeln!(prompt, "Parent section: {}", parent);
    }
    let _ = writeln!(prompt, "Target length: about {} words.", input.target_words);
    let _ = writeln!(prompt, "\nContext so far:\n{}", input.context);

    if input.section_type.expects_citations() {
        if input.sources.is_empty() {
            let _ = writeln!(prompt, "\nNo research sources are available. Do not invent citations.");
        } else {
            let _ = writeln!(prompt, "\nSources:");
            for (i, source) in input.sources.iter().enumerate() {
                let _ = writeln!(prompt, "[{}] {} - {}", i + 1, source.title, source.url);
                if !source.excerpt.is_empty() {
                    let _ = writeln!(prompt, "    {}", source.excerpt);
                }
            }
        }
    }
    prompt
}

/// 重新生成的提示词，只列出未通过的检查项
pub fn regeneration_prompt(input: &PromptInput<'_>, previous: &str, failing: &[QualityCheck]) -> String {
    let mut prompt = user_prompt(input);
    let _ = writeln!(prompt, "\nThe previous draft was rejected. Fix only these problems:");
    for check in failing {
        let _ = writeln!(prompt, "- {}", fix_instruction(*check, input));
    }
    let _ = writeln!(prompt, "\nPrevious draft:\n{}", previous);
    prompt
}

fn fix_instruction(check: QualityCheck, input: &PromptInput<'_>) -> String {
    match check {
        QualityCheck::WordCount => format!("length must be close to {} words", input.target_words),
        QualityCheck::CitationDensity => "cite the numbered sources where claims are made".to_string(),
        QualityCheck::HeadingHierarchy => "do not use `# ` headings or skip heading levels".to_string(),
        QualityCheck::KeywordStuffing => format!(
            "the keyword \"{}\" is overused, use it at most a few times and prefer synonyms",
            input.keyword
        ),
        QualityCheck::DuplicateSentences => "remove repeated sentences".to_string(),
        QualityCheck::Formatting => "keep paragraphs short and whitespace clean".to_string(),
        QualityCheck::FaqQuestions => "every FAQ entry must be a question ending with `?`".to_string(),
        QualityCheck::KeywordPresence => format!("mention \"{}\" naturally", input.keyword),
    }
}
