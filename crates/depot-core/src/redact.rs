/// Masks a phone number for log output, keeping the leading `+` and the
/// last four digits. Inputs too short to redact meaningfully collapse to
/// `****` so a typo never leaks through unmasked.
pub fn redact_phone(phone: &str) -> String {
    let trimmed = phone.trim();
    let digits = trimmed.chars().filter(|value| value.is_ascii_digit()).count();
    if digits <= 4 {
        return "****".to_string();
    }
    let mut remaining_clear = 4usize;
    let mut masked: Vec<char> = Vec::with_capacity(trimmed.len());
    for value in trimmed.chars().rev() {
        if value.is_ascii_digit() {
            if remaining_clear > 0 {
                remaining_clear -= 1;
                masked.push(value);
            } else {
                masked.push('*');
            }
        } else {
            masked.push(value);
        }
    }
    masked.into_iter().rev().collect()
}
