use scribe_core::TemplateHint;

const HTML: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="UTF-8">
    <meta name="viewport" content="width=device-width, initial-scale=1.0">
    <title>New document</title>
    <style>
        body {
            font-family: Arial, sans-serif;
            margin: 0;
            padding: 20px;
        }
    </style>
</head>
<body>
    <h1>New HTML document</h1>
    <p>Content to edit...</p>
</body>
</html>"#;

const PHP: &str = "<?php
/**
 * New PHP file
 */

// Your code here

?>";

const CSS: &str = "/* New CSS file */

body {
    margin: 0;
    padding: 0;
    font-family: Arial, sans-serif;
}";

const JS: &str = "/**
 * New JavaScript file
 */

// Your code here
";

/// Starting content for a freshly created file.
pub fn boilerplate(template: TemplateHint) -> &'static str {
    match template {
        TemplateHint::Html => HTML,
        TemplateHint::Php => PHP,
        TemplateHint::Css => CSS,
        TemplateHint::Js => JS,
        TemplateHint::Blank => "",
    }
}
