pub const FIELD_EXTRACTION_SYSTEM_PROMPT: &str = "You are an information extraction agent. \
Your job is to extract specific fields from the provided document TEXT. \
Always respond with a single valid JSON object containing EXACTLY the requested keys. \
If a value is missing or not present, use null. \
Never include explanations, markdown, or extra keys. \
The document may be in Brazilian Portuguese.";

/// Build the user prompt for one extraction call.
///
/// The previous-example block is appended only when retrieval found one.
pub fn build_extraction_prompt(
    label: &str,
    keys: &[String],
    text: &str,
    rag_context: Option<&str>,
) -> String {
    let required = serde_json::to_string(keys).unwrap_or_else(|_| "[]".to_string());

    let mut prompt = format!(
        "Current task information:\n\
         - document_label: {label}\n\
         - required_fields: {required}\n\
         ----- BEGIN CURRENT DOCUMENT TEXT -----\n\
         {text}\n\
         ----- END CURRENT DOCUMENT TEXT -----\n\n\
         Instructions:\n\
         1. Return ONLY a valid JSON object.\n\
         2. The JSON MUST contain exactly the keys in required_fields.\n\
         3. If a field does not appear, set it to null.\n\
         4. Do not include explanations or markdown.\n\
         5. Use ONLY the provided text; do not infer beyond it.\n\n"
    );

    if let Some(context) = rag_context.filter(|c| !c.trim().is_empty()) {
        prompt.push_str(
            "You may use the following previous example from the same document type. \
             Only reuse a value if it clearly matches the CURRENT document.\n\
             ----- BEGIN PREVIOUS EXAMPLE -----\n",
        );
        prompt.push_str(context);
        prompt.push_str("\n----- END PREVIOUS EXAMPLE -----\n\n");
    }

    prompt
}
