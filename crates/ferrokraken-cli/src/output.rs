use std::io::Write;

use serde_json::Value;

use crate::error::CliError;

/// Writes one JSON document to stdout.
pub fn render(value: &Value, pretty: bool) -> Result<(), CliError> {
    let stdout = std::io::stdout();
    let mut handle = stdout.lock();
    write_json(&mut handle, value, pretty)
}

fn write_json(writer: &mut impl Write, value: &Value, pretty: bool) -> Result<(), CliError> {
    if pretty {
        serde_json::to_writer_pretty(&mut *writer, value)?;
    } else {
        serde_json::to_writer(&mut *writer, value)?;
    }
    writeln!(writer)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn compact_output_is_a_single_line() {
        let mut buffer = Vec::new();
        write_json(&mut buffer, &json!({"success": true, "resources": []}), false).expect("write");
        assert_eq!(
            String::from_utf8(buffer).expect("utf8"),
            "{\"resources\":[],\"success\":true}\n"
        );
    }

    #[test]
    fn pretty_output_is_indented() {
        let mut buffer = Vec::new();
        write_json(&mut buffer, &json!({"success": true}), true).expect("write");
        assert_eq!(
            String::from_utf8(buffer).expect("utf8"),
            "{\n  \"success\": true\n}\n"
        );
    }
}
