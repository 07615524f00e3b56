//! Telegram HTML for the messages the relay sends on its own.

use crate::{
    directory::UserRecord,
    events::{Gender, ScoreChangedEvent, ScoreValue},
    messaging::types::{Keyboard, SendOptions},
};

pub const LIST_COMMAND: &str = "/list";
pub const START_COMMAND: &str = "/start";
pub const RESET_COMMAND: &str = "/reset";

pub fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn name_prefix(gender: Gender) -> &'static str {
    match gender {
        Gender::Female => "Пані",
        _ => "Пане",
    }
}

pub fn render_score(score: &ScoreValue) -> String {
    if score.value != 0.0 {
        // Shortest representation: 2.5 → "2.5", 3.0 → "3".
        format!("{}", score.value)
    } else if score.is_absent {
        "пропуск".to_string()
    } else {
        "0".to_string()
    }
}

pub fn welcome_authorized(user: &UserRecord) -> (String, SendOptions) {
    let text = format!(
        "{} {}, вас успішно авторизовано.\n\nЯ повідомлятиму про нові оцінки. Перелік дисциплін: {LIST_COMMAND}",
        name_prefix(user.domain_gender()),
        escape_html(&user.first_name),
    );
    let keyboard = Keyboard::Reply(vec![format!("{LIST_COMMAND} Мої результати")]);
    (text, SendOptions::html().with_keyboard(keyboard))
}

pub fn welcome_anonymous() -> (String, SendOptions) {
    let text = "Вітаю! Щоб отримувати оцінки, пройдіть авторизацію через особистий кабінет.";
    (text.to_string(), SendOptions::plain().with_keyboard(Keyboard::Remove))
}

pub fn logout_finished() -> (String, SendOptions) {
    let text = "Ви вийшли з облікового запису. Щоб повернутися, натисніть /start.";
    let keyboard = Keyboard::Reply(vec![format!("{START_COMMAND} Запустити!")]);
    (text.to_string(), SendOptions::plain().with_keyboard(keyboard))
}

/// The single in-place message that tracks a score of one discipline.
pub fn score_changed(event: &ScoreChangedEvent, new_score: &ScoreValue) -> (String, SendOptions) {
    let text = format!(
        "<b>Нова оцінка</b>\nДисципліна №{}, заняття №{}\n\nБуло: {}\nСтало: <b>{}</b>",
        event.discipline_id,
        event.lesson_id,
        render_score(&event.previous),
        render_score(new_score),
    );
    (text, SendOptions::html().protected())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::types::ParseMode;

    #[test]
    fn escapes_html() {
        let s = r#"<a href="x&y">"#;
        assert_eq!(escape_html(s), "&lt;a href=&quot;x&amp;y&quot;&gt;");
    }

    #[test]
    fn renders_scores() {
        let v = |value, is_absent| ScoreValue { value, is_absent };
        assert_eq!(render_score(&v(2.5, false)), "2.5");
        assert_eq!(render_score(&v(3.0, false)), "3");
        assert_eq!(render_score(&v(0.0, true)), "пропуск");
        assert_eq!(render_score(&v(0.0, false)), "0");
    }

    #[test]
    fn welcome_uses_gender_prefix_and_escapes_name() {
        let user = UserRecord {
            id: 1,
            first_name: "<Оля>".to_string(),
            gender: crate::directory::GenderType::Female as i32,
            ..Default::default()
        };
        let (text, opts) = welcome_authorized(&user);
        assert!(text.starts_with("Пані &lt;Оля&gt;"));
        assert!(matches!(opts.keyboard, Keyboard::Reply(_)));
    }

    #[test]
    fn fixed_notices_carry_no_markup() {
        let (_, logout) = logout_finished();
        let (_, anonymous) = welcome_anonymous();
        assert_eq!(logout.parse_mode, ParseMode::Plain);
        assert_eq!(anonymous.keyboard, Keyboard::Remove);
        assert_eq!(anonymous.parse_mode, ParseMode::Plain);
    }

    #[test]
    fn score_message_is_protected() {
        let ev = ScoreChangedEvent {
            discipline_id: 234,
            lesson_id: 150,
            ..Default::default()
        };
        let (text, opts) = score_changed(&ev, &ScoreValue { value: 4.0, is_absent: false });
        assert!(text.contains("<b>4</b>"));
        assert!(opts.protect_content);
    }
}
