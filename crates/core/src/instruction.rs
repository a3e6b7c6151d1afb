//! System instruction templates.

use crate::metadata::ParticipantIdentity;

/// Canned teaching prompt used when no lesson context is available.
pub const FALLBACK_INSTRUCTION: &str = "
Você é o Professor Mike, um professor de inglês brasileiro experiente e muito paciente.
REGRA FUNDAMENTAL: Quando o usuário fala em PORTUGUÊS, responda em PORTUGUÊS primeiro,
depois convide para praticar em inglês. Quando o usuário fala em INGLÊS, responda só em inglês.
CORREÇÃO ATIVA: Você SEMPRE identifica e corrige erros de pronúncia, gramática ou vocabulário.
Estilo: claro, conciso, amigável; evite teoria longa; sempre feche com ação.
";

/// The fallback prompt, opened by an introduction addressed to `user_name`.
pub fn fallback_instruction(user_name: &str) -> String {
    format!(
        "Se apresente como Professor Mike e comece uma aula para {user_name}.\n{FALLBACK_INSTRUCTION}"
    )
}

/// Fills the template placeholders and appends the greet-by-name rule.
pub fn personalize(
    instruction: &str,
    identity: &ParticipantIdentity,
    teacher_name: Option<&str>,
) -> String {
    let name = &identity.name;
    let mut text = instruction.replace("{userName}", name);
    if let Some(teacher) = teacher_name {
        text = text.replace("{teacherName}", teacher);
    }
    text.push_str(&format!(
        "\n\nO NOME DO ALUNO É: {name}. REGRA OBRIGATÓRIA: Ao iniciar a conversa, SEMPRE \
         cumprimente o aluno pelo nome (ex: \"Olá, {name}!\"). Use o nome dele ao longo da aula também."
    ));
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fallback_mentions_user() {
        let text = fallback_instruction("Helena");
        assert!(text.starts_with("Se apresente como Professor Mike e comece uma aula para Helena."));
        assert!(text.ends_with(FALLBACK_INSTRUCTION));
    }

    #[test]
    fn test_personalize_replaces_placeholders() {
        let identity = ParticipantIdentity {
            name: "Igor".into(),
            ..Default::default()
        };
        let text = personalize("{teacherName} teaches {userName}.", &identity, Some("Julia"));
        assert!(text.starts_with("Julia teaches Igor."));
        assert!(text.contains("O NOME DO ALUNO É: Igor."));
        assert!(text.contains("\"Olá, Igor!\""));
    }

    #[test]
    fn test_personalize_keeps_unknown_teacher_placeholder() {
        let text = personalize("{teacherName}", &ParticipantIdentity::default(), None);
        assert!(text.starts_with("{teacherName}"));
        assert!(text.contains("aluno"));
    }
}
