/// Title given to a thread at creation, before the first exchange names it.
pub const DEFAULT_THREAD_TITLE: &str = "New chat";

/// Title applied when the side request fails or returns nothing usable.
pub const FALLBACK_TITLE: &str = "Untitled";

/// System instruction for the title side session.
pub const TITLE_INSTRUCTION: &str =
    "You are an expert at creating very short, descriptive chat titles (1-3 words).";

/// Builds the one-shot prompt from the first exchange. The model is asked to
/// answer in the language of the dialogue itself.
pub fn build_title_prompt(user_text: &str, model_text: &str) -> String {
    format!(
        "Detect the language of the following dialogue and produce a VERY SHORT, \
         descriptive title (1-3 words, the title only, no trailing punctuation) \
         in that same language. The dialogue:\n\n\
         User: \"{user_text}\"\n\nModel: \"{model_text}\""
    )
}

/// Normalizes a raw title response: quotes stripped everywhere, bold markers
/// removed, at most one trailing punctuation mark dropped. Empty results fall
/// back to [`FALLBACK_TITLE`].
pub fn sanitize_title(raw: &str) -> String {
    let mut title = raw.replace('"', "").trim().to_string();
    title = title.replace("**", "");
    if let Some(last) = title.chars().last()
        && matches!(last, '.' | '?' | '!' | ',' | ';' | ':')
    {
        title.pop();
    }

    let title = title.trim();
    if title.is_empty() {
        FALLBACK_TITLE.to_string()
    } else {
        title.to_string()
    }
}
