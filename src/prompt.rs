//! Construcción del prompt: bloque de contexto acotado + plantilla por idioma.

use crate::{locale::Locale, models::ScoredDocument};

/// Máximo de caracteres de contexto que se envían al modelo (corte duro).
pub const MAX_CONTEXT_CHARS: usize = 5000;

/// Frase exacta que debe devolver el modelo cuando el contexto no basta.
pub fn refusal_text(locale: Locale) -> &'static str {
    match locale {
        Locale::En => {
            "I cannot answer as there is no relevant information in the provided documents."
        }
        Locale::Ja => "提供された文書に関連情報がないため回答できません。",
    }
}

/// Concatena los documentos (`【nombre】` + contenido) en el orden recibido y
/// recorta el resultado a `MAX_CONTEXT_CHARS` caracteres.
pub fn build_context(docs: &[ScoredDocument]) -> String {
    let joined = docs
        .iter()
        .map(|doc| format!("【{}】\n{}", doc.name, doc.content))
        .collect::<Vec<_>>()
        .join("\n\n");
    truncate_chars(&joined, MAX_CONTEXT_CHARS).to_string()
}

/// Prompt completo para la pregunta y los documentos recuperados.
pub fn build_prompt(question: &str, docs: &[ScoredDocument], locale: Locale) -> String {
    let context = build_context(docs);
    let refusal = refusal_text(locale);
    match locale {
        Locale::En => format!(
            "You are an assistant answering based on the provided documents.\n\
             Answer the question in English using only the content from the [Reference Documents] below.\n\
             If the answer is not contained in the documents, state \"{refusal}\"\n\
             \n\
             [Reference Documents]\n\
             {context}\n\
             \n\
             [Question]\n\
             {question}"
        ),
        Locale::Ja => format!(
            "あなたは提供された文書に基づいて回答するアシスタントです。\n\
             以下の【参照文書】の内容のみを使用して、質問に日本語で答えてください。\n\
             文書に答えが含まれていない場合は、「{refusal}」と答えてください。\n\
             \n\
             【参照文書】\n\
             {context}\n\
             \n\
             【質問】\n\
             {question}"
        ),
    }
}

fn truncate_chars(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((byte_idx, _)) => &s[..byte_idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(name: &str, content: &str) -> ScoredDocument {
        ScoredDocument {
            name: name.to_string(),
            content: content.to_string(),
            score: 1,
        }
    }

    #[test]
    fn context_joins_with_bracketed_headers_in_order() {
        let ctx = build_context(&[doc("b.txt", "segundo"), doc("a.txt", "primero")]);
        assert_eq!(ctx, "【b.txt】\nsegundo\n\n【a.txt】\nprimero");
    }

    #[test]
    fn context_is_cut_at_5000_chars() {
        let big = "あ".repeat(6000);
        let ctx = build_context(&[doc("big", &big)]);
        assert_eq!(ctx.chars().count(), MAX_CONTEXT_CHARS);
        assert!(ctx.starts_with("【big】\nあ"));

        let small = build_context(&[doc("s", "corto")]);
        assert_eq!(small, "【s】\ncorto");
    }

    #[test]
    fn english_prompt_layout() {
        let prompt = build_prompt("What is Rust?", &[doc("r.md", "Rust is a language.")], Locale::En);
        let expected = "You are an assistant answering based on the provided documents.\n\
Answer the question in English using only the content from the [Reference Documents] below.\n\
If the answer is not contained in the documents, state \"I cannot answer as there is no relevant information in the provided documents.\"\n\
\n\
[Reference Documents]\n\
【r.md】\n\
Rust is a language.\n\
\n\
[Question]\n\
What is Rust?";
        assert_eq!(prompt, expected);
    }

    #[test]
    fn japanese_prompt_contains_refusal_and_question() {
        let prompt = build_prompt("Rustとは？", &[], Locale::Ja);
        assert!(prompt.contains("「提供された文書に関連情報がないため回答できません。」と答えてください。"));
        assert!(prompt.contains("【参照文書】\n\n\n【質問】\nRustとは？"));
        assert!(prompt.ends_with("Rustとは？"));
    }

    #[test]
    fn prompt_never_carries_more_than_limit_of_context() {
        let question = "¿pregunta larga?";
        let docs = vec![doc("x", &"z".repeat(9000))];
        let prompt = build_prompt(question, &docs, Locale::En);
        let context = build_context(&docs);
        assert!(prompt.contains(question));
        assert!(prompt.contains(&context));
        assert_eq!(prompt.matches('z').count(), MAX_CONTEXT_CHARS - "【x】\n".chars().count());
    }
}
