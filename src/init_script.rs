//! Groovy snippet submitted once after every spawn. Its output is discarded.
//!
//! The `display` closure is what produces the `image/png;base64,...` lines that the
//! classifier lifts out of ordinary output.

use crate::config::InitOptions;

const FORCE_XY: &str = r#"System.setProperty("org.geotools.referencing.forceXY", "true")"#;

const SILENCE_LOGGING: &[&str] = &[
    "java.util.logging.LogManager.getLogManager().reset()",
    "java.util.logging.Logger.getLogger(java.util.logging.Logger.GLOBAL_LOGGER_NAME).setLevel(java.util.logging.Level.OFF)",
];

pub fn render(options: &InitOptions) -> String {
    let mut script = String::new();
    if options.force_xy {
        push_line(&mut script, FORCE_XY);
    }
    if options.silence_logging {
        for line in SILENCE_LOGGING {
            push_line(&mut script, line);
        }
    }
    push_display_helper(&mut script, options.image_size);
    script
}

fn push_display_helper(script: &mut String, size: u32) {
    push_line(script, "__kernelDraw = { drawable ->");
    push_line(script, "    def out = new ByteArrayOutputStream()");
    push_line(
        script,
        &format!(
            "    geoscript.render.Draw.draw(drawable, out: out, imageType: \"base64\", size: [{size}, {size}])"
        ),
    );
    push_line(
        script,
        "    new String(org.apache.commons.codec.binary.Base64.encodeBase64(out.toByteArray()), \"UTF-8\")",
    );
    push_line(script, "}");
    push_line(script, "display = { obj ->");
    push_line(script, "    if (obj instanceof java.awt.Image) {");
    push_line(script, "        def out = new ByteArrayOutputStream()");
    push_line(script, "        javax.imageio.ImageIO.write(obj, \"png\", out)");
    push_line(
        script,
        "        \"image/png;base64,${javax.xml.bind.DatatypeConverter.printBase64Binary(out.toByteArray())}\"",
    );
    push_line(script, "    } else if (obj instanceof geoscript.geom.Geometry) {");
    push_line(
        script,
        "        \"image/png;base64,${__kernelDraw(obj as geoscript.geom.Geometry)}\"",
    );
    push_line(script, "    } else if (obj instanceof geoscript.feature.Feature) {");
    push_line(
        script,
        "        \"image/png;base64,${__kernelDraw(obj as geoscript.feature.Feature)}\"",
    );
    push_line(script, "    } else if (obj instanceof geoscript.layer.Layer) {");
    push_line(
        script,
        "        \"image/png;base64,${__kernelDraw(obj as geoscript.layer.Layer)}\"",
    );
    push_line(script, "    } else {");
    push_line(script, "        obj");
    push_line(script, "    }");
    push_line(script, "}");
}

fn push_line(script: &mut String, line: &str) {
    script.push_str(line);
    script.push('\n');
}
