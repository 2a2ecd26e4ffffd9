pub fn render_schema() -> String {
	let init = include_str!("../../../sql/init.sql");

	expand_includes(init)
}

fn expand_includes(sql: &str) -> String {
	let mut out = String::new();

	for line in sql.lines() {
		let trimmed = line.trim();

		if let Some(path) = trimmed.strip_prefix("\\ir ") {
			match path.trim() {
				"tables/001_runs.sql" => out.push_str(include_str!("../../../sql/tables/001_runs.sql")),
				"tables/002_run_steps.sql" =>
					out.push_str(include_str!("../../../sql/tables/002_run_steps.sql")),
				"tables/003_clarifications.sql" =>
					out.push_str(include_str!("../../../sql/tables/003_clarifications.sql")),
				"tables/004_proposed_actions.sql" =>
					out.push_str(include_str!("../../../sql/tables/004_proposed_actions.sql")),
				"tables/005_clinical_records.sql" =>
					out.push_str(include_str!("../../../sql/tables/005_clinical_records.sql")),
				"tables/006_audit_entries.sql" =>
					out.push_str(include_str!("../../../sql/tables/006_audit_entries.sql")),
				_ => out.push_str(line),
			}
		} else {
			out.push_str(line);
		}

		out.push('\n');
	}

	out
}
