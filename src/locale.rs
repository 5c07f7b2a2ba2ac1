//! Textos visibles para el usuario en los dos idiomas soportados (inglés y japonés).
//! El idioma se fija al arrancar y no cambia durante la sesión.

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Locale {
    En,
    Ja,
}

impl Locale {
    /// Interpreta una etiqueta de idioma (`ja_JP.UTF-8`, `ja`, `en-US`...).
    /// Todo lo que no empiece por `ja` se trata como inglés.
    pub fn from_tag(tag: &str) -> Self {
        if tag.trim().to_lowercase().starts_with("ja") {
            Self::Ja
        } else {
            Self::En
        }
    }

    pub fn messages(self) -> &'static Messages {
        match self {
            Self::En => &EN,
            Self::Ja => &JA,
        }
    }

    /// Texto de la respuesta cuando el adaptador de modelos falla.
    pub fn error_answer(self, detail: &str) -> String {
        format!("❌ {}: {}", self.messages().error_occurred, detail)
    }

    pub fn sync_changed(self, added: usize, updated: usize) -> String {
        match self {
            Self::En => format!("Synced: {added} added, {updated} updated."),
            Self::Ja => format!("同期フォルダから {added} 件追加、{updated} 件更新しました。"),
        }
    }

    pub fn files_added(self, added: usize, skipped: usize) -> String {
        match self {
            Self::En => format!("Added {added} new file(s) to the RAG sources ({skipped} skipped)."),
            Self::Ja => format!("新しいファイル {added} 件をRAGソースに追加しました（{skipped} 件スキップ）。"),
        }
    }

    pub fn memo_saved(self, filename: &str) -> String {
        match self {
            Self::En => format!("Saved the OCR/pasted text as \"{filename}\" and added it to the RAG sources."),
            Self::Ja => format!("OCR/貼付テキストを「{filename}」として保存し、RAGソースとして永続化しました。"),
        }
    }

    pub fn invalid_credential(self, status: u16) -> String {
        match self {
            Self::En => format!(
                "The API key is invalid or lacks permission (Status: {status}). The saved key was deleted. Send again with a new key."
            ),
            Self::Ja => format!(
                "APIキーが無効か、権限がありません (Status: {status})。保存されたキーを削除しました。再度送信して新しいキーを入力してください。"
            ),
        }
    }
}

/// Cadenas fijas por idioma. Se exponen también al frontend vía `/api/config`.
#[derive(Debug, Serialize)]
pub struct Messages {
    pub question: &'static str,
    pub answer: &'static str,
    pub waiting: &'static str,
    pub send: &'static str,
    pub sending: &'static str,
    pub error_occurred: &'static str,
    pub empty_question: &'static str,
    pub request_in_flight: &'static str,
    pub missing_api_key: &'static str,
    pub preview_title: &'static str,
    pub no_documents: &'static str,
    pub file_name_label: &'static str,
    pub pasted_text_document: &'static str,
    pub pasted_text_memo: &'static str,
    pub pasted_image_prefix: &'static str,
    pub nothing_to_save: &'static str,
    pub files_up_to_date: &'static str,
    pub no_text_files: &'static str,
    pub sync_error: &'static str,
    pub reset_done: &'static str,
}

const EN: Messages = Messages {
    question: "Question",
    answer: "Answer",
    waiting: "Waiting for response...",
    send: "Send",
    sending: "Sending...",
    error_occurred: "Error occurred",
    empty_question: "Please enter a question.",
    request_in_flight: "A request is already in progress.",
    missing_api_key: "An API key is required to use Gemini models. Please enter it in the input field.",
    preview_title: "RAG Source Document Preview (Latest 5)",
    no_documents: "No RAG source documents available.",
    file_name_label: "File Name",
    pasted_text_document: "Pasted text (temporary)",
    pasted_text_memo: "Pasted text",
    pasted_image_prefix: "Pasted image",
    nothing_to_save: "There is no text (OCR result or pasted content) to save.",
    files_up_to_date: "Files are up to date.",
    no_text_files: "No text files found.",
    sync_error: "Error syncing files.",
    reset_done: "All RAG source documents have been reset.",
};

const JA: Messages = Messages {
    question: "質問",
    answer: "回答",
    waiting: "応答待機中...",
    send: "送信",
    sending: "送信中...",
    error_occurred: "エラーが発生しました",
    empty_question: "質問を入力してください。",
    request_in_flight: "別のリクエストを処理中です。",
    missing_api_key: "Geminiモデルを使用するにはAPIキーが必要です。入力欄に設定してください。",
    preview_title: "RAGソース文書プレビュー (最新5件)",
    no_documents: "現在RAGのソースとなる文書はありません。",
    file_name_label: "ファイル名",
    pasted_text_document: "貼付けテキスト(一時)",
    pasted_text_memo: "貼付テキスト",
    pasted_image_prefix: "一時貼付画像",
    nothing_to_save: "永続化するテキスト（OCR結果または貼付エリアの内容）がありません。",
    files_up_to_date: "ファイルの内容は最新です。",
    no_text_files: "読み込み可能なテキストファイルが見つかりませんでした。",
    sync_error: "フォルダからのファイル読み込み中にエラーが発生しました。",
    reset_done: "RAGソース文書を全てリセットしました。",
};
